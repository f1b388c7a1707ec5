//! APC encoder (spec.md §4.B): maps semantic records onto frame bytes, built
//! on top of [`frame::FrameBuilder`]. Frame-type and sub-code numbering is
//! grounded in the `FrameType`/`PerfAttrsSubCode` tables found in
//! `daemon/agents/perf/apc_encoders.h` and `perf_frame_packer.hpp` of the
//! original collector this crate's wire format is compatible with.

use frame::{FrameBuilder, FrameError, MAXSIZE_PACK32, MAXSIZE_PACK64};

/// Top-level APC frame type tag (first byte of every frame).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum FrameType {
    Summary = 1,
    Name = 2,
    Counter = 3,
    BlockCounter = 4,
    SchedTrace = 5,
    External = 6,
    PerfAttrs = 7,
    PerfData = 8,
    PerfAux = 9,
    PerfSync = 10,
}

/// Sub-code carried inside a `PERF_ATTRS` frame's payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PerfAttrsSubCode {
    Pea = 1,
    Keys = 2,
    Format = 3,
    Maps = 4,
    Comm = 5,
    OnlineCpu = 7,
    OfflineCpu = 8,
    Kallsyms = 9,
    Counters = 10,
    HeaderPage = 11,
    HeaderEvent = 12,
}

/// Every frame a single-threaded drain loop can reasonably emit is bounded by
/// this many bytes, header included (spec.md §3, §4.F, §9 open question
/// resolved to `1 MiB - header_overhead`).
pub const MAX_RESPONSE_LENGTH: usize = 1024 * 1024;

/// Upper bound on bytes consumed by a `PERF_DATA`/`PERF_AUX` frame's fixed
/// header fields (type + length + sub-fields before the variable payload),
/// mirrored from `data_record_apc_encoder_t::max_header_size` /
/// `aux_record_apc_encoder_t::max_header_size`.
pub const PERF_DATA_MAX_HEADER: usize = 1 + 4 + MAXSIZE_PACK32 + 4; // type + len + cpu + reserved-length
pub const PERF_AUX_MAX_HEADER: usize = 1 + 4 + MAXSIZE_PACK32 + MAXSIZE_PACK64 + MAXSIZE_PACK32;

pub const PERF_DATA_MAX_PAYLOAD: usize = MAX_RESPONSE_LENGTH - PERF_DATA_MAX_HEADER;
pub const PERF_AUX_MAX_PAYLOAD: usize = MAX_RESPONSE_LENGTH - PERF_AUX_MAX_HEADER;

#[derive(Debug, Fail)]
pub enum EncodeError {
    #[fail(display = "frame buffer error: {}", _0)]
    Frame(FrameError),
}

impl From<FrameError> for EncodeError {
    fn from(e: FrameError) -> Self {
        EncodeError::Frame(e)
    }
}

/// Result of encoding a `PERF_DATA`/`PERF_AUX` payload that may have had to
/// truncate to fit the frame maximum.
pub struct EncodedSpan {
    /// Number of source bytes actually encoded into the frame.
    pub consumed: usize,
    /// Whether the full span was encoded in one frame.
    pub complete: bool,
}

/// `PEA`: kernel attribute bytes plus the counter key that names them.
pub fn encode_pea(b: &mut FrameBuilder, attr_bytes: &[u8], key: i32) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Pea as i32)?;
    b.write_bytes(attr_bytes)?;
    b.pack_var_i32(key)?;
    b.end()?;
    Ok(())
}

/// `KEYS`: a table mapping kernel sample/stream ids to counter keys.
pub fn encode_keys(b: &mut FrameBuilder, entries: &[(i64, i32)]) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Keys as i32)?;
    b.pack_var_i32(entries.len() as i32)?;
    for &(sample_id, key) in entries {
        b.pack_var_i64(sample_id)?;
        b.pack_var_i32(key)?;
    }
    b.end()?;
    Ok(())
}

/// `ONLINE_CPU` / `OFFLINE_CPU`.
pub fn encode_cpu_event(
    b: &mut FrameBuilder,
    online: bool,
    monotonic_delta: i64,
    cpu: i32,
) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    let sub = if online { PerfAttrsSubCode::OnlineCpu } else { PerfAttrsSubCode::OfflineCpu };
    b.pack_var_i32(sub as i32)?;
    b.pack_var_i64(monotonic_delta)?;
    b.pack_var_i32(cpu)?;
    b.end()?;
    Ok(())
}

/// `MAPS`: raw `/proc/<pid>/maps` contents for one PID/TID.
pub fn encode_maps(b: &mut FrameBuilder, pid: i32, tid: i32, maps_text: &str) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Maps as i32)?;
    b.pack_var_i32(pid)?;
    b.pack_var_i32(tid)?;
    b.write_string(maps_text)?;
    b.end()?;
    Ok(())
}

/// `COMM`: process identity.
pub fn encode_comm(b: &mut FrameBuilder, pid: i32, tid: i32, image_path: &str, comm: &str) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Comm as i32)?;
    b.pack_var_i32(pid)?;
    b.pack_var_i32(tid)?;
    b.write_string(image_path)?;
    b.write_string(comm)?;
    b.end()?;
    Ok(())
}

/// `KALLSYMS`: the raw contents of `/proc/kallsyms`, captured once.
pub fn encode_kallsyms(b: &mut FrameBuilder, text: &str) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Kallsyms as i32)?;
    b.write_string(text)?;
    b.end()?;
    Ok(())
}

/// `COUNTERS`: a periodic snapshot of `{core, key, value}` triples,
/// terminated by a sentinel `core = -1` entry.
pub fn encode_counters(
    b: &mut FrameBuilder,
    monotonic_delta: i64,
    samples: &[(i32, i32, i64)],
) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfAttrs as u8)?;
    b.pack_var_i32(PerfAttrsSubCode::Counters as i32)?;
    b.pack_var_i64(monotonic_delta)?;
    for &(core, key, value) in samples {
        b.pack_var_i32(core)?;
        b.pack_var_i32(key)?;
        b.pack_var_i64(value)?;
    }
    b.pack_var_i32(-1)?;
    b.end()?;
    Ok(())
}

/// One key/value attribute contributed to the `SUMMARY` frame's trailing
/// table.
pub struct SummaryAttribute<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

/// `SUMMARY`: the capture's opening frame. `newline_canary` lets the host
/// detect whether the transport normalised `\n` to `\r\n`.
pub fn encode_summary(
    b: &mut FrameBuilder,
    newline_canary: &str,
    clock_realtime_ns: i64,
    clock_boottime_ns: i64,
    clock_monotonic_raw_ns: i64,
    clock_monotonic_ns: i64,
    attributes: &[SummaryAttribute],
) -> Result<(), EncodeError> {
    b.begin(FrameType::Summary as u8)?;
    b.write_string(newline_canary)?;
    b.pack_var_i64(clock_realtime_ns)?;
    b.pack_var_i64(clock_boottime_ns)?;
    b.pack_var_i64(clock_monotonic_raw_ns)?;
    b.pack_var_i64(clock_monotonic_ns)?;
    for attr in attributes {
        b.write_string(attr.key)?;
        b.write_string(attr.value)?;
    }
    b.write_string("")?;
    b.end()?;
    Ok(())
}

/// `CORE_NAME`: human-readable identification of one core.
pub fn encode_core_name(b: &mut FrameBuilder, core: i32, cpuid: u32, display_name: &str) -> Result<(), EncodeError> {
    b.begin(FrameType::Name as u8)?;
    b.pack_var_i32(core)?;
    b.pack_var_i32(cpuid as i32)?;
    b.write_string(display_name)?;
    b.end()?;
    Ok(())
}

/// `PERF_DATA`: a sequence of 64-bit words copied verbatim from the kernel
/// ring, truncated on a record boundary if the full span doesn't fit.
/// `record_boundaries` lists cumulative word-offsets at which a record ends,
/// so the encoder can stop exactly on one of them.
pub fn encode_perf_data(
    b: &mut FrameBuilder,
    cpu: i32,
    words: &[i64],
    record_boundaries: &[usize],
) -> Result<EncodedSpan, EncodeError> {
    b.begin(FrameType::PerfData as u8)?;
    b.pack_var_i32(cpu)?;
    let len_range = b.reserve(4)?;

    let mut consumed = 0usize;
    let mut bytes_written = 0usize;
    let mut last_good = 0usize;

    for &boundary in record_boundaries {
        if boundary <= consumed {
            continue;
        }
        let mut candidate_bytes = bytes_written;
        for &w in &words[consumed..boundary] {
            candidate_bytes += var_i64_len(w);
        }
        if candidate_bytes > PERF_DATA_MAX_PAYLOAD && bytes_written > 0 {
            break;
        }
        for &w in &words[consumed..boundary] {
            b.pack_var_i64(w)?;
        }
        bytes_written = candidate_bytes;
        last_good = boundary;
        consumed = boundary;
        if bytes_written > PERF_DATA_MAX_PAYLOAD {
            break;
        }
    }

    b.patch_u32_le(len_range, bytes_written as u32);
    b.end()?;

    Ok(EncodedSpan {
        consumed: last_good,
        complete: last_good == record_boundaries.last().cloned().unwrap_or(0) && last_good == words.len(),
    })
}

fn var_i64_len(value: i64) -> usize {
    let mut tmp = FrameBuilder::new(MAXSIZE_PACK64);
    tmp.pack_var_i64(value).expect("scratch buffer sized for one var-i64");
    tmp.len()
}

/// `PERF_AUX`: raw AUX bytes, possibly split across a wrap boundary in the
/// source ring; truncates at the frame maximum on a byte boundary.
pub fn encode_perf_aux(
    b: &mut FrameBuilder,
    cpu: i32,
    tail_offset: u64,
    first: &[u8],
    second: &[u8],
) -> Result<EncodedSpan, EncodeError> {
    let total_available = first.len() + second.len();
    let to_send = ::std::cmp::min(total_available, PERF_AUX_MAX_PAYLOAD);

    b.begin(FrameType::PerfAux as u8)?;
    b.pack_var_i32(cpu)?;
    b.pack_var_i64(tail_offset as i64)?;
    b.pack_var_i32(to_send as i32)?;

    let from_first = ::std::cmp::min(first.len(), to_send);
    b.write_bytes(&first[..from_first])?;
    let from_second = to_send - from_first;
    if from_second > 0 {
        b.write_bytes(&second[..from_second])?;
    }
    b.end()?;

    Ok(EncodedSpan {
        consumed: to_send,
        complete: to_send == total_available,
    })
}

/// `PERF_SYNC`: correlation anchor between the daemon's clock and the
/// kernel/hardware clocks.
pub fn encode_perf_sync(
    b: &mut FrameBuilder,
    pid: i32,
    tid: i32,
    frequency: i64,
    monotonic_raw_ns: i64,
    arch_timer_cycles: i64,
) -> Result<(), EncodeError> {
    b.begin(FrameType::PerfSync as u8)?;
    b.pack_var_i32(0)?; // cpu, ignored
    b.pack_var_i32(pid)?;
    b.pack_var_i32(tid)?;
    b.pack_var_i64(frequency)?;
    b.pack_var_i64(monotonic_raw_ns)?;
    b.pack_var_i64(arch_timer_cycles)?;
    b.end()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_frame_round_trips_count_and_entries() {
        let mut b = FrameBuilder::new(4096);
        encode_keys(&mut b, &[(100, 16), (101, 17), (-5, 0)]).unwrap();
        let bytes = b.into_bytes();
        assert_eq!(bytes[0], FrameType::PerfAttrs as u8);
        assert_eq!(bytes[1], PerfAttrsSubCode::Keys as i32 as u8);
    }

    #[test]
    fn perf_data_splits_on_record_boundary_when_oversized() {
        let mut b = FrameBuilder::new(PERF_DATA_MAX_PAYLOAD + 4096);
        let words: Vec<i64> = (0..2000).map(|i| i as i64 * 123456789).collect();
        let boundaries: Vec<usize> = (1..=2000).collect();

        let span = encode_perf_data(&mut b, 0, &words, &boundaries).unwrap();
        assert!(span.consumed <= words.len());
        assert!(!span.complete || span.consumed == words.len());
    }

    #[test]
    fn perf_data_small_record_set_completes_in_one_frame() {
        let mut b = FrameBuilder::new(4096);
        let words = vec![1i64, 2, 3, 4];
        let boundaries = vec![2usize, 4];
        let span = encode_perf_data(&mut b, 3, &words, &boundaries).unwrap();
        assert_eq!(span.consumed, 4);
        assert!(span.complete);
    }

    #[test]
    fn perf_aux_concatenates_wrapped_spans() {
        let mut b = FrameBuilder::new(4096);
        let first = [1u8, 2, 3];
        let second = [4u8, 5];
        let span = encode_perf_aux(&mut b, 2, 1000, &first, &second).unwrap();
        assert_eq!(span.consumed, 5);
        assert!(span.complete);
        let bytes = b.into_bytes();
        assert_eq!(&bytes[bytes.len() - 5..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn perf_aux_truncates_at_payload_maximum() {
        let mut b = FrameBuilder::new(MAX_RESPONSE_LENGTH * 2);
        let first = vec![0xABu8; PERF_AUX_MAX_PAYLOAD + 10];
        let span = encode_perf_aux(&mut b, 0, 0, &first, &[]).unwrap();
        assert_eq!(span.consumed, PERF_AUX_MAX_PAYLOAD);
        assert!(!span.complete);
    }

    #[test]
    fn summary_frame_terminates_attribute_table_with_empty_key() {
        let mut b = FrameBuilder::new(4096);
        encode_summary(
            &mut b,
            "\n",
            1,
            2,
            3,
            4,
            &[SummaryAttribute { key: "uname", value: "Linux" }],
        )
        .unwrap();
        assert_eq!(b.as_bytes()[0], FrameType::Summary as u8);
    }
}
