//! A segmented, append-only replicated log for a Raft consensus
//! implementation.
//!
//! Three cooperating pieces, leaves-first:
//!
//! - [`codec`]: serializes/deserializes a single [`codec::LogEntry`] to a
//!   length-delimited, checksummed frame.
//! - [`segment`]: [`segment::LogSegment`], an in-memory cache for one
//!   contiguous range of entries, mirroring exactly one file on disk.
//! - [`log`]: [`log::SegmentedLog`], the coordinator exposing the full log
//!   surface to Raft -- append, get, truncate, and crash recovery.
//!
//! The log has no policy about what it replicates; it only guarantees
//! durable, ordered storage of opaque consensus entries. Leader election,
//! snapshotting, client session handling, RPC transport, and the
//! configuration-change voting semantics of the surrounding consensus module
//! are all out of scope.

pub mod codec;
pub mod config;
pub mod error;
pub mod log;
pub mod repo;
pub mod segment;
mod varint;

pub use codec::LogEntry;
pub use config::{Options, SyncMode};
pub use log::SegmentedLog;
pub use segment::{LogRecord, LogSegment};
