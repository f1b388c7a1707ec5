//! Ring-buffer monitor (spec.md §4.F): drains one leader fd's data and AUX
//! rings, extracts records respecting wrap-around, and hands them to the
//! APC encoder. Grounded in the teacher's removed `sys::RingBuffer::slices`
//! wrap-extraction helper and `sample::ring_buffer`'s head/tail fencing,
//! reassembled around [`mmap::RingMapping`].

use apc;
use arena::ArenaSink;
use error::{Error, Result};
use frame::FrameBuilder;
use mmap::{AuxMapping, RingMapping};

/// Rounds a perf record's `size` field up to the next 8-byte multiple, per
/// the kernel's record alignment guarantee (spec.md §3 "Perf record").
pub fn round_up_8(size: u16) -> usize {
    ((size as usize) + 7) & !7
}

struct ParsedHeader {
    size: u16,
}

fn parse_header(bytes: &[u8]) -> ParsedHeader {
    ParsedHeader {
        size: u16::from_le_bytes([bytes[6], bytes[7]]),
    }
}

fn concat_span(first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(first.len() + second.len());
    v.extend_from_slice(first);
    v.extend_from_slice(second);
    v
}

/// Per-leader-fd drain state: the last tail position this monitor has
/// advanced to, for the data ring and (if present) the AUX ring.
pub struct RingMonitor {
    pub cpu: i32,
    data_tail: u64,
    aux_tail: u64,
}

impl RingMonitor {
    pub fn new(cpu: i32) -> Self {
        RingMonitor { cpu, data_tail: 0, aux_tail: 0 }
    }

    /// Drains whatever complete records are currently available in the data
    /// ring into zero or more `PERF_DATA` frames, committed through `arena`.
    /// Never advances `data_tail` past bytes it failed to hand off (spec.md
    /// §4.F "back-pressure").
    pub fn poll_data(&mut self, ring: &RingMapping, arena: &ArenaSink) -> Result<()> {
        let head = ring.data_head();
        let buffer_size = ring.data_len() as u64;
        let mut tail = self.data_tail;

        let mut words: Vec<i64> = Vec::new();
        let mut boundaries: Vec<usize> = Vec::new();
        let mut record_start_tails: Vec<u64> = Vec::new();

        while head - tail >= 8 {
            let (h1, h2) = ring.slices(tail, 8);
            let header_bytes = if h2.is_empty() { h1.to_vec() } else { concat_span(h1, h2) };
            let header = parse_header(&header_bytes);

            if header.size == 0 {
                return Err(Error::RingInconsistent {
                    cpu: self.cpu,
                    reason: "record size field is zero".to_owned(),
                });
            }

            let record_size = round_up_8(header.size);
            if tail + record_size as u64 > head {
                break;
            }
            if record_size as u64 > buffer_size {
                return Err(Error::RingInconsistent {
                    cpu: self.cpu,
                    reason: format!("record size {} exceeds ring capacity {}", record_size, buffer_size),
                });
            }

            let (s1, s2) = ring.slices(tail, record_size);
            let record_bytes = concat_span(s1, s2);

            for chunk in record_bytes.chunks_exact(8) {
                words.push(i64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ]));
            }
            boundaries.push(words.len());
            tail += record_size as u64;
            record_start_tails.push(tail);
        }

        if words.is_empty() {
            return Ok(());
        }

        let mut word_offset = 0usize;
        let mut boundary_idx = 0usize;
        let mut committed_tail = self.data_tail;

        while word_offset < words.len() {
            let relative_boundaries: Vec<usize> =
                boundaries[boundary_idx..].iter().map(|b| b - word_offset).collect();

            let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
            let span = apc::encode_perf_data(&mut builder, self.cpu, &words[word_offset..], &relative_boundaries)
                .map_err(|e| Error::RingInconsistent { cpu: self.cpu, reason: format!("{:?}", e) })?;

            if span.consumed == 0 {
                // A single record's payload alone exceeds the frame's
                // maximum; encode_perf_data already truncated it into one
                // frame on a byte boundary internally, so there is nothing
                // further to do but treat it as fully consumed.
                break;
            }

            let bytes = builder.into_bytes();
            match arena.try_request_space(bytes.len())? {
                Some(mut reservation) => {
                    reservation.as_mut_slice().copy_from_slice(&bytes);
                    reservation.commit(bytes.len());
                }
                None => {
                    // Sink is full: stop here without advancing data_tail
                    // past what we've already committed.
                    break;
                }
            }

            while boundary_idx < boundaries.len() && boundaries[boundary_idx] <= word_offset + span.consumed {
                committed_tail = record_start_tails[boundary_idx];
                boundary_idx += 1;
            }
            word_offset += span.consumed;
        }

        if committed_tail != self.data_tail {
            self.data_tail = committed_tail;
            ring.set_data_tail(committed_tail);
        }

        Ok(())
    }

    /// Drains the AUX ring, if the leader has one, into zero or more
    /// `PERF_AUX` frames. The AUX head/tail cursors live in the data ring's
    /// metadata page; the bytes live in the separate `aux` mapping.
    pub fn poll_aux(&mut self, ring: &RingMapping, aux: &AuxMapping, arena: &ArenaSink) -> Result<()> {
        if ring.aux_size() == 0 {
            return Ok(());
        }

        let head = ring.aux_head();
        let mut tail = self.aux_tail;

        while head > tail {
            let available = ::std::cmp::min((head - tail) as usize, aux.len());
            let (first, second) = aux.slices(tail, available);

            let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
            let span = apc::encode_perf_aux(&mut builder, self.cpu, tail, first, second)
                .map_err(|e| Error::RingInconsistent { cpu: self.cpu, reason: format!("{:?}", e) })?;

            if span.consumed == 0 {
                break;
            }

            let bytes = builder.into_bytes();
            match arena.try_request_space(bytes.len())? {
                Some(mut reservation) => {
                    reservation.as_mut_slice().copy_from_slice(&bytes);
                    reservation.commit(bytes.len());
                }
                None => break,
            }

            tail += span.consumed as u64;
            self.aux_tail = tail;
            ring.set_aux_tail(tail);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_8_rounds_to_next_multiple() {
        assert_eq!(round_up_8(0), 0);
        assert_eq!(round_up_8(1), 8);
        assert_eq!(round_up_8(8), 8);
        assert_eq!(round_up_8(9), 16);
        assert_eq!(round_up_8(16), 16);
    }

    #[test]
    fn header_size_zero_is_detectable_before_looping() {
        let mut bytes = [0u8; 8];
        bytes[6] = 0;
        bytes[7] = 0;
        let header = parse_header(&bytes);
        assert_eq!(header.size, 0);
    }

    #[test]
    fn concat_span_preserves_byte_order_across_two_pieces() {
        let a = [1u8, 2, 3];
        let b = [4u8, 5];
        assert_eq!(concat_span(&a, &b), vec![1, 2, 3, 4, 5]);
    }
}
