//! Configuration surface.
//!
//! [`Options`] plays the role the teacher crate's `Options` struct plays for
//! `Commitlog`: a small, `Copy`-able bag of tuning knobs passed to
//! [`crate::log::SegmentedLog::open`]. `log.storage.dir` (§6) is deliberately
//! not a field here -- it's the directory argument `open` already takes.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Default roll threshold: 8 MiB, per `log.segment.max.bytes`'s documented default.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

/// `log.sync.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncMode {
    /// fsync after every appended frame.
    Always,
    /// fsync after `max_entries` frames or `max_interval` elapsed, whichever
    /// comes first. [`crate::log::SegmentedLog::flush`] forces durability
    /// between batches.
    Batch { max_entries: u32, max_interval: Duration },
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Batch {
            max_entries: 1024,
            max_interval: Duration::from_millis(100),
        }
    }
}

/// [`crate::log::SegmentedLog`] tuning knobs.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Options {
    /// Roll threshold in bytes (`log.segment.max.bytes`).
    pub max_segment_size: u64,
    /// Durability policy (`log.sync.mode`, `log.sync.batch.*`).
    pub sync_mode: SyncMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl Options {
    /// Parse options from dotted configuration keys, as they would appear in
    /// a properties file (§6): `log.segment.max.bytes`, `log.sync.mode`,
    /// `log.sync.batch.entries`, `log.sync.batch.interval_ms`.
    ///
    /// Keys not recognized here are ignored, so callers can pass a shared
    /// config map that also carries unrelated settings.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut opts = Options::default();

        if let Some(v) = map.get("log.segment.max.bytes") {
            opts.max_segment_size = parse_u64("log.segment.max.bytes", v)?;
        }

        let mode = map.get("log.sync.mode").map(String::as_str);
        match mode {
            None | Some("batch") => {
                let max_entries = match map.get("log.sync.batch.entries") {
                    Some(v) => parse_u32("log.sync.batch.entries", v)?,
                    None => match opts.sync_mode {
                        SyncMode::Batch { max_entries, .. } => max_entries,
                        SyncMode::Always => 1024,
                    },
                };
                let max_interval = match map.get("log.sync.batch.interval_ms") {
                    Some(v) => Duration::from_millis(parse_u64("log.sync.batch.interval_ms", v)?),
                    None => Duration::from_millis(100),
                };
                opts.sync_mode = SyncMode::Batch { max_entries, max_interval };
            }
            Some("always") => opts.sync_mode = SyncMode::Always,
            Some(other) => {
                return Err(ConfigError::UnknownSyncMode {
                    value: other.to_string(),
                })
            }
        }

        Ok(opts)
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidInteger {
        key,
        value: value.to_string(),
        source,
    })
}

fn parse_u32(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidInteger {
        key,
        value: value.to_string(),
        source,
    })
}
