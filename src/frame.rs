//! Frame builder (spec.md §4.A): packs typed fields into a growable byte
//! buffer with frame delimiters. Grounded in the teacher's existing use of
//! `bytes::BytesMut` (see `tokio-codec`'s `Decoder` impl in the old
//! `sample::record` module) generalized from "decode incoming" to "encode
//! outgoing".

use bytes::{BufMut, BytesMut};

/// Maximum bytes a `pack_var_i32` encoding can occupy.
pub const MAXSIZE_PACK32: usize = 5;
/// Maximum bytes a `pack_var_i64` encoding can occupy.
pub const MAXSIZE_PACK64: usize = 10;

/// A single outbound frame never exceeds this many bytes, header included
/// (spec.md §3 "APC frame").
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Fail)]
pub enum FrameError {
    #[fail(display = "writing {} more bytes would exceed the buffer's capacity of {}", requested, capacity)]
    CapacityExceeded { requested: usize, capacity: usize },
    #[fail(display = "end() called with no frame in progress")]
    NoFrameInProgress,
}

/// Wraps a growable byte container and tracks a write cursor plus the start
/// offset of the current frame.
pub struct FrameBuilder {
    buf: BytesMut,
    capacity: usize,
    frame_start: Option<usize>,
}

impl FrameBuilder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            frame_start: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes remaining before the buffer's declared capacity is exhausted.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    fn ensure_room(&self, additional: usize) -> Result<(), FrameError> {
        if self.buf.len() + additional > self.capacity {
            Err(FrameError::CapacityExceeded {
                requested: additional,
                capacity: self.capacity,
            })
        } else {
            Ok(())
        }
    }

    /// Records the current write cursor as the frame start and emits the
    /// single-byte frame-type prefix.
    pub fn begin(&mut self, frame_type: u8) -> Result<(), FrameError> {
        self.ensure_room(1)?;
        self.frame_start = Some(self.buf.len());
        self.buf.put_u8(frame_type);
        Ok(())
    }

    /// Writes a signed 32-bit integer using a self-describing variable-length
    /// encoding: 7 bits per byte, continuation bit in the MSB, sign-extended
    /// on decode. Uses at most [`MAXSIZE_PACK32`] bytes.
    pub fn pack_var_i32(&mut self, value: i32) -> Result<(), FrameError> {
        self.pack_var_signed(value as i64, MAXSIZE_PACK32)
    }

    /// As [`Self::pack_var_i32`] but for the full `i64` range, at most
    /// [`MAXSIZE_PACK64`] bytes.
    pub fn pack_var_i64(&mut self, value: i64) -> Result<(), FrameError> {
        self.pack_var_signed(value, MAXSIZE_PACK64)
    }

    fn pack_var_signed(&mut self, value: i64, max_bytes: usize) -> Result<(), FrameError> {
        let mut bytes = [0u8; MAXSIZE_PACK64];
        let mut n = 0;
        let mut v = value;
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            // sign-extending shift: stop once the remaining bits are all
            // copies of the sign bit AND match the sign bit we just wrote.
            let done = (v == 0 && (byte & 0x40) == 0) || (v == -1 && (byte & 0x40) != 0);
            if !done {
                byte |= 0x80;
            }
            bytes[n] = byte;
            n += 1;
            if done {
                break;
            }
        }
        debug_assert!(n <= max_bytes);
        self.write_bytes(&bytes[..n])
    }

    /// Raw copy.
    pub fn write_bytes(&mut self, span: &[u8]) -> Result<(), FrameError> {
        self.ensure_room(span.len())?;
        self.buf.put_slice(span);
        Ok(())
    }

    /// Length-prefixed with [`Self::pack_var_i32`]; does not null-terminate
    /// except where the schema requires.
    pub fn write_string(&mut self, s: &str) -> Result<(), FrameError> {
        self.pack_var_i32(s.len() as i32)?;
        self.write_bytes(s.as_bytes())
    }

    /// Advances the cursor by `n` bytes, returning the byte range for later
    /// patching (used to reserve a 4-byte length field populated after the
    /// payload is known).
    pub fn reserve(&mut self, n: usize) -> Result<::std::ops::Range<usize>, FrameError> {
        self.ensure_room(n)?;
        let start = self.buf.len();
        self.buf.put_slice(&vec![0u8; n]);
        Ok(start..start + n)
    }

    /// Overwrites a previously reserved range, e.g. with the final payload
    /// length.
    pub fn patch_u32_le(&mut self, range: ::std::ops::Range<usize>, value: u32) {
        debug_assert_eq!(range.end - range.start, 4);
        self.buf[range].copy_from_slice(&value.to_le_bytes());
    }

    /// If no bytes were written after the type prefix, discards the frame
    /// (rewinds the cursor); otherwise commits it.
    pub fn end(&mut self) -> Result<(), FrameError> {
        let start = self.frame_start.take().ok_or(FrameError::NoFrameInProgress)?;
        if self.buf.len() == start + 1 {
            self.buf.truncate(start);
        }
        Ok(())
    }

    /// Unconditionally rewinds the cursor to the frame start.
    pub fn abort(&mut self) {
        if let Some(start) = self.frame_start.take() {
            self.buf.truncate(start);
        }
    }

    /// Consumes the builder, returning the bytes written so far.
    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_decode_i64(mut bytes: &[u8]) -> i64 {
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = bytes[0];
            bytes = &bytes[1..];
            result |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && (byte & 0x40) != 0 {
                    result |= -1i64 << shift;
                }
                break;
            }
        }
        result
    }

    #[test]
    fn var_i64_round_trips_extremes_and_samples() {
        let samples = [
            0i64,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            i32::max_value() as i64,
            i32::min_value() as i64,
            i64::max_value(),
            i64::min_value(),
            1234567890123,
            -1234567890123,
        ];

        for &value in &samples {
            let mut b = FrameBuilder::new(64);
            b.pack_var_i64(value).unwrap();
            let bytes = b.into_bytes();
            assert!(bytes.len() <= MAXSIZE_PACK64);
            assert_eq!(roundtrip_decode_i64(&bytes), value, "value={}", value);
        }
    }

    #[test]
    fn begin_then_no_write_discards_frame() {
        let mut b = FrameBuilder::new(64);
        b.begin(7).unwrap();
        b.end().unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn begin_then_write_commits_frame() {
        let mut b = FrameBuilder::new(64);
        b.begin(7).unwrap();
        b.write_bytes(&[1, 2, 3]).unwrap();
        b.end().unwrap();
        assert_eq!(b.as_bytes(), &[7, 1, 2, 3]);
    }

    #[test]
    fn abort_rewinds_regardless_of_writes() {
        let mut b = FrameBuilder::new(64);
        b.begin(7).unwrap();
        b.write_bytes(&[1, 2, 3]).unwrap();
        b.abort();
        assert!(b.is_empty());
    }

    #[test]
    fn capacity_exceeded_is_reported_and_caller_must_abort() {
        let mut b = FrameBuilder::new(4);
        b.begin(1).unwrap();
        let err = b.write_bytes(&[0; 16]);
        assert!(err.is_err());
        b.abort();
        assert!(b.is_empty());
    }

    #[test]
    fn reserve_then_patch_length() {
        let mut b = FrameBuilder::new(64);
        b.begin(9).unwrap();
        let len_range = b.reserve(4).unwrap();
        b.write_bytes(b"hello").unwrap();
        b.patch_u32_le(len_range, 5);
        b.end().unwrap();
        assert_eq!(&b.as_bytes()[1..5], &5u32.to_le_bytes());
        assert_eq!(&b.as_bytes()[5..], b"hello");
    }

    #[test]
    fn write_string_is_length_prefixed() {
        let mut b = FrameBuilder::new(64);
        b.write_string("hi").unwrap();
        assert_eq!(b.as_bytes(), &[2, b'h', b'i']);
    }
}
