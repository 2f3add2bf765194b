//! lib0 binary primitives shared by the sync codec and the awareness wire
//! format, on top of the encoders that ship with `yrs`.
//!
//! ```text
//! varint:  ┌─┬───────┐┌─┬───────┐
//!          │c│ 7 bits││c│ 7 bits│ …   c = continuation (0x80), low groups first
//!          └─┴───────┘└─┴───────┘
//! buf:     varint(len) ++ bytes
//! string:  buf(utf-8 bytes)
//! ```
//!
//! Writing goes straight through [`Write`] on a `Vec<u8>`. Reading wraps the
//! lib0 [`Cursor`] in a [`Reader`] that is stricter than lib0 itself: it
//! rejects integers wider than 64 bits, non-canonical encodings and invalid
//! UTF-8, so that every accepted byte string re-encodes to itself.

pub use yrs::encoding::read::Cursor;
pub use yrs::encoding::write::Write;

use yrs::encoding::read::{Error as ReadError, Read};

use crate::protocol::DecodeError;

/// Longest canonical varint for a `u64` (ceil(64 / 7)).
const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `value` occupies as a varint.
pub fn var_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Bounds-checked, canonical-only reader over untrusted input.
pub struct Reader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(buf) }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.cursor.buf.len() - self.cursor.next
    }

    pub fn is_empty(&self) -> bool {
        !self.cursor.has_content()
    }

    /// Current read offset, used in error messages.
    pub fn position(&self) -> usize {
        self.cursor.next
    }

    /// Read one varint. lib0 tolerates wrapped and padded encodings; both are
    /// refused here.
    pub fn read_var(&mut self) -> Result<u64, DecodeError> {
        let start = self.cursor.next;
        let value: u64 = self.cursor.read_var().map_err(|e| match e {
            ReadError::EndOfBuffer(_) => DecodeError::UnexpectedEof {
                offset: self.cursor.next,
                expected: "varint",
            },
            _ => DecodeError::VarintOverflow { offset: start },
        })?;

        let consumed = self.cursor.next - start;
        let last = self.cursor.buf[self.cursor.next - 1];
        // The tenth group may only carry the single remaining bit.
        if consumed > MAX_VARINT_LEN || (consumed == MAX_VARINT_LEN && last > 1) {
            return Err(DecodeError::VarintOverflow { offset: start });
        }
        if consumed != var_len(value) {
            return Err(DecodeError::NonCanonicalVarint { offset: start });
        }
        Ok(value)
    }

    /// Read `len` raw bytes.
    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::TruncatedPayload {
                offset: self.cursor.next,
                declared: len,
                available: self.remaining(),
            });
        }
        let buf: &'a [u8] = self.cursor.buf;
        let start = self.cursor.next;
        self.cursor
            .read_exact(len)
            .map_err(|_| DecodeError::UnexpectedEof { offset: start, expected: "bytes" })?;
        Ok(&buf[start..start + len])
    }

    /// Read a length-prefixed byte buffer.
    pub fn read_buf(&mut self) -> Result<&'a [u8], DecodeError> {
        let offset = self.cursor.next;
        let len = self.read_var()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::ValueOutOfRange { offset, value: len })?;
        self.read_exact(len)
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// lib0's own `read_string` skips validation, so the bytes are checked here.
    pub fn read_string(&mut self) -> Result<&'a str, DecodeError> {
        let offset = self.cursor.next;
        let bytes = self.read_buf()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes { offset: self.cursor.next, count: self.remaining() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: u64) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_var(value);
        buf
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(1), vec![0x01]);
        assert_eq!(encoded(127), vec![0x7F]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(300), vec![0xAC, 0x02]);
        assert_eq!(encoded(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_varint_read_back() {
        for value in [0, 1, 99, 100, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let buf = encoded(value);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_var().unwrap(), value);
            assert!(reader.is_empty());
            assert_eq!(var_len(value), buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut reader = Reader::new(&[0x80]);
        assert!(matches!(reader.read_var(), Err(DecodeError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_varint_non_canonical_rejected() {
        // 0 encoded with a redundant continuation group.
        let mut reader = Reader::new(&[0x80, 0x00]);
        assert!(matches!(reader.read_var(), Err(DecodeError::NonCanonicalVarint { .. })));
    }

    #[test]
    fn test_varint_overflow_rejected() {
        let mut bytes = vec![0xFF; 9];
        bytes.push(0x02);
        let mut reader = Reader::new(&bytes);
        assert!(matches!(reader.read_var(), Err(DecodeError::VarintOverflow { .. })));

        // lib0 accepts an eleventh group and wraps; we do not.
        let mut eleven = vec![0x80; 10];
        eleven.push(0x01);
        let mut reader = Reader::new(&eleven);
        assert!(matches!(reader.read_var(), Err(DecodeError::VarintOverflow { .. })));

        let endless = vec![0xFF; 16];
        let mut reader = Reader::new(&endless);
        assert!(reader.read_var().is_err());
    }

    #[test]
    fn test_buf_declared_length_too_long() {
        let mut reader = Reader::new(&[0x05, 1, 2]);
        match reader.read_buf() {
            Err(DecodeError::TruncatedPayload { declared, available, .. }) => {
                assert_eq!(declared, 5);
                assert_eq!(available, 2);
            }
            other => panic!("expected truncated payload, got {other:?}"),
        }
    }

    #[test]
    fn test_buf_written_by_lib0_reads_back() {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_buf([1u8, 2, 3]);
        buf.write_var(7u8);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_buf().unwrap(), &[1u8, 2, 3][..]);
        assert_eq!(reader.read_var().unwrap(), 7);
        reader.finish().unwrap();
    }

    #[test]
    fn test_string_roundtrip_and_invalid_utf8() {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_string("héllo");
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string().unwrap(), "héllo");
        reader.finish().unwrap();

        let mut reader = Reader::new(&[0x02, 0xC3, 0x28]);
        assert!(matches!(reader.read_string(), Err(DecodeError::InvalidUtf8 { .. })));
    }

    #[test]
    fn test_finish_reports_trailing_bytes() {
        let reader = Reader::new(&[1, 2, 3]);
        assert!(matches!(reader.finish(), Err(DecodeError::TrailingBytes { count: 3, .. })));
    }
}
