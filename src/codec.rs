//! [`LogEntry`] and its on-disk frame encoding.
//!
//! Frame layout (see also [`crate::segment::SEGMENT_MAGIC`] for the
//! per-segment file header that precedes the first frame):
//!
//! ```text
//! +----------------+-----------------+----------------+
//! | length: varint | body: L bytes   | checksum: u32  |
//! +----------------+-----------------+----------------+
//! ```
//!
//! `length` is the varint-encoded byte length of `body`. `checksum` is the
//! CRC32 (big-endian) of `body` alone.

use std::io::{self, Read, Write};

use crc32c::{Crc32cReader, Crc32cWriter};

use crate::error::DecodeError;
use crate::varint::{decode_varint, encode_varint, varint_size};

/// Upper bound on a single frame's `body` length, checked against the
/// varint-decoded length prefix before it's used to size an allocation. A
/// corrupt or bit-flipped length prefix is caught by the trailing checksum
/// eventually, but the checksum is only computed over `body` -- it can't
/// protect the read of `body` itself, so an absurd length must be rejected
/// up front rather than handed to `vec![0u8; len]`.
pub const MAX_FRAME_BODY_LEN: usize = 64 * 1024 * 1024;

/// A single, opaque entry in the replicated log.
///
/// The log never inspects `payload`; `index` and `term` are the only fields
/// it reasons about (see invariants I2/I3 on [`crate::segment::LogSegment`]).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            term,
            payload: payload.into(),
        }
    }

    /// Canonical, deterministic encoding of `(index, term, payload)`.
    ///
    /// `index` and `term` are fixed-width big-endian `u64`s; `payload` is
    /// prefixed with its own varint length so the body is self-delimiting
    /// independent of the outer frame.
    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16 + varint_size(self.payload.len() as u64) + self.payload.len());
        body.extend_from_slice(&self.index.to_be_bytes());
        body.extend_from_slice(&self.term.to_be_bytes());
        // encode_varint on a Vec<u8> never fails.
        encode_varint(self.payload.len() as u64, &mut body).expect("write to Vec is infallible");
        body.extend_from_slice(&self.payload);
        body
    }

    fn decode_body(body: &[u8]) -> Result<Self, DecodeError> {
        if body.len() < 16 {
            return Err(DecodeError::Truncated {
                need: 16,
                have: body.len(),
            });
        }
        let index = u64::from_be_bytes(body[0..8].try_into().unwrap());
        let term = u64::from_be_bytes(body[8..16].try_into().unwrap());
        let mut rest = &body[16..];
        let payload_len = decode_varint(&mut rest)?.ok_or(DecodeError::BadVarint)? as usize;
        if rest.len() != payload_len {
            return Err(DecodeError::Truncated {
                need: payload_len,
                have: rest.len(),
            });
        }
        Ok(Self {
            index,
            term,
            payload: rest.to_vec(),
        })
    }
}

/// Number of bytes [`encode`] would write for `entry`.
pub fn frame_size(entry: &LogEntry) -> usize {
    let body_len = body_len(entry);
    varint_size(body_len as u64) + body_len + 4
}

fn body_len(entry: &LogEntry) -> usize {
    16 + varint_size(entry.payload.len() as u64) + entry.payload.len()
}

/// Write `entry`'s frame to `out`. Pure and deterministic: encoding the same
/// entry twice produces identical bytes.
pub fn encode<W: Write>(entry: &LogEntry, out: &mut W) -> io::Result<()> {
    let body = entry.encode_body();
    encode_varint(body.len() as u64, out)?;

    let mut crc_out = Crc32cWriter::new(out);
    crc_out.write_all(&body)?;
    let checksum = crc_out.crc32c();
    let out = crc_out.into_inner();
    out.write_all(&checksum.to_be_bytes())?;

    Ok(())
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` at a clean EOF (no bytes at all could be read for the
/// length prefix). Any error once the length has been read successfully
/// decoding indicates a malformed or truncated frame.
pub fn decode<R: Read>(reader: &mut R) -> Result<Option<LogEntry>, DecodeError> {
    let len = match decode_varint(reader) {
        Ok(Some(len)) => len,
        Ok(None) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => return Err(DecodeError::BadVarint),
        // A length prefix torn off mid-byte at the tail of the file is a
        // truncated frame, not an I/O failure: the replay path must be able
        // to treat it the same as a frame cut short anywhere else so an
        // in-progress segment's recoverable torn-tail handling applies here
        // too (see `SegmentedLog::open`).
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(DecodeError::Truncated { need: 1, have: 0 }),
        Err(e) => return Err(DecodeError::Io(e)),
    };
    // A length prefix is as trustworthy as whatever bits precede it on disk:
    // a bit-flip here never touches the trailing checksum (which covers only
    // `body`), so an absurd or overflowing `len` must be rejected before it's
    // used to size an allocation, not after. `MAX_FRAME_BODY_LEN` is an easy
    // multiple of the default segment size, comfortably above any real entry.
    if len > MAX_FRAME_BODY_LEN as u64 {
        return Err(DecodeError::FrameTooLarge {
            len,
            max: MAX_FRAME_BODY_LEN as u64,
        });
    }
    let len = len as usize;

    let mut crc_in = Crc32cReader::new(reader);
    let mut body = vec![0u8; len];
    if let Err(e) = crc_in.read_exact(&mut body) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(DecodeError::Truncated { need: len, have: 0 });
        }
        return Err(DecodeError::Io(e));
    }
    let computed = crc_in.crc32c();
    let reader = crc_in.into_inner();

    let mut checksum_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut checksum_bytes) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(DecodeError::Truncated { need: 4, have: 0 });
        }
        return Err(DecodeError::Io(e));
    }
    let expected = u32::from_be_bytes(checksum_bytes);

    if expected != computed {
        return Err(DecodeError::ChecksumMismatch {
            expected,
            actual: computed,
        });
    }

    LogEntry::decode_body(&body).map(Some)
}
