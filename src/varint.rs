//! Varint encoding and decoding functions.
//!
//! We use Protobuf's [Base-128 varint] encoding.
//!
//! Unsigned integers are split into 7-bit chunks, with the least significant
//! chunk first. Each chunk is placed in the low 7 bits of a byte.
//! Non-terminal bytes have the high bit set. The final byte in an integer
//! has the high bit zeroed.
//!
//! [Base-128 varint]: https://protobuf.dev/programming-guides/encoding/#varints

use std::io::{self, Read, Write};

/// Maximum number of bytes a [`u64`] can expand to when varint-encoded.
pub const MAX_LEN: usize = 10;

#[inline]
pub fn encode_varint<W: Write>(mut value: u64, out: &mut W) -> io::Result<()> {
    loop {
        if value < 0x80 {
            out.write_all(&[value as u8])?;
            return Ok(());
        } else {
            out.write_all(&[((value & 0x7f) | 0x80) as u8])?;
            value >>= 7;
        }
    }
}

/// Number of bytes [`encode_varint`] would write for `value`.
#[inline]
pub fn varint_size(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

/// Decode a varint from `reader`.
///
/// Returns `Ok(None)` if the reader is at a clean EOF before any byte of the
/// varint is read. Once the first byte has been consumed, a subsequent EOF
/// (or a varint exceeding [`MAX_LEN`] bytes) is reported as
/// [`io::ErrorKind::InvalidData`] / [`io::ErrorKind::UnexpectedEof`].
#[inline]
pub fn decode_varint<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];

    for i in 0..MAX_LEN {
        match reader.read(&mut byte)? {
            0 if i == 0 => return Ok(None),
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated varint")),
            _ => {}
        }
        let b = byte[0];
        result |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(Some(result));
        }
        shift += 7;
    }

    Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn varint_roundtrip(val in any::<u64>()) {
            let mut buf = Vec::new();
            encode_varint(val, &mut buf).unwrap();
            prop_assert_eq!(buf.len(), varint_size(val));
            let decoded = decode_varint(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(decoded, Some(val));
        }
    }

    #[test]
    fn decode_empty_is_none() {
        let mut empty: &[u8] = &[];
        assert_eq!(decode_varint(&mut empty).unwrap(), None);
    }

    #[test]
    fn decode_truncated_is_eof_error() {
        let mut buf: &[u8] = &[0x80];
        let err = decode_varint(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
