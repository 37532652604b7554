//! Error taxonomy for the segmented log.
//!
//! Mirrors the policy table of the log subsystem's design notes: most
//! variants here are surfaced to the caller and treated as process-fatal by
//! convention, except [`DecodeError::Truncated`] encountered while replaying
//! an in-progress segment, which [`crate::log::SegmentedLog::open`] recovers
//! from silently (see that function's docs).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors decoding a single [`crate::codec::LogEntry`] frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed varint length prefix")]
    BadVarint,
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("checksum mismatch: expected {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("frame body length {len} exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors returned by [`crate::log::SegmentedLog`] and [`crate::segment::LogSegment`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("index gap: expected {expected}, got {actual}")]
    IndexGap { expected: u64, actual: u64 },

    #[error("append to a segment that is not open (start_index={start_index})")]
    NotOpen { start_index: u64 },

    #[error("batch append spans multiple terms ({first_term} and {other_term})")]
    MixedTerm { first_term: u64, other_term: u64 },

    #[error("index {index} is out of range (compacted watermark is {watermark})")]
    OutOfRange { index: u64, watermark: u64 },

    #[error("segment {path:?} is corrupt at offset {offset}")]
    CorruptSegment {
        path: PathBuf,
        offset: u64,
        #[source]
        source: DecodeError,
    },

    #[error("storage directory {dir:?} is corrupt: {reason}")]
    CorruptDirectory { dir: PathBuf, reason: String },

    #[error("log is closed")]
    ClosedLog,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors parsing [`crate::config::Options`] from string key/value pairs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown value {value:?} for log.sync.mode (expected \"always\" or \"batch\")")]
    UnknownSyncMode { value: String },
    #[error("invalid value {value:?} for {key}: {source}")]
    InvalidInteger {
        key: &'static str,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}
