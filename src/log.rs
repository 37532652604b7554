//! [`SegmentedLog`]: the coordinator exposing the full log surface to Raft.
//!
//! Owns an ordered list of [`LogSegment`]s and the single writable handle for
//! the tail segment, and is responsible for everything the segments
//! themselves don't know about: rolling to a new segment, writing frames to
//! disk, the sync policy, and crash recovery from a storage directory.
//!
//! Concurrency model: single-writer, multi-reader, externally lock-guarded
//! (§5) -- this type does no internal locking of its own.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::codec::{self, LogEntry};
use crate::config::{Options, SyncMode};
use crate::error::{DecodeError, Error};
use crate::repo::{FileLike, Repo, SegmentFile};
use crate::segment::{LogSegment, SEGMENT_MAGIC};

/// The currently writable (tail) segment's backing file.
struct Head<S> {
    start_index: u64,
    file: S,
}

/// A segmented, append-only replicated log.
pub struct SegmentedLog<R: Repo> {
    repo: R,
    opts: Options,
    /// Ordered by `start_index`. At most the last element is open (I4).
    segments: Vec<LogSegment>,
    head: Option<Head<R::Segment>>,
    /// Watermark below which indices are considered compacted. This crate
    /// implements no compaction (it's a Non-goal), so this never advances
    /// past its initial value, and the `OutOfRange` check it feeds is
    /// effectively dormant -- kept so the policy described in §4.3 has
    /// somewhere to live once a higher layer starts compacting.
    compacted_watermark: i64,
    pending_since_sync: u32,
    last_sync_at: Instant,
    closed: bool,
    /// Set in the body of a method that returns an `Err` while holding
    /// partially-mutated state, so `Drop` doesn't try to flush into that
    /// state and produce a second, confusing error.
    panicked: bool,
}

impl<R: Repo> SegmentedLog<R> {
    /// Open (and, if empty, initialize) a segmented log backed by `repo`.
    ///
    /// Performs crash recovery per §4.4: enumerates segment files, replays
    /// each, and silently truncates a torn tail write in the in-progress
    /// segment. Any other inconsistency is reported as
    /// [`Error::CorruptDirectory`] or [`Error::CorruptSegment`].
    pub fn open(repo: R, opts: Options) -> Result<Self, Error> {
        let mut files = repo.existing_segments()?;
        files.sort_by_key(SegmentFile::start_index);

        let in_progress_count = files
            .iter()
            .filter(|f| matches!(f, SegmentFile::InProgress { .. }))
            .count();
        if in_progress_count > 1 {
            return Err(Error::CorruptDirectory {
                dir: Default::default(),
                reason: "more than one in-progress segment".into(),
            });
        }
        if let (Some(last), true) = (files.last(), in_progress_count == 1) {
            if !matches!(last, SegmentFile::InProgress { .. }) {
                return Err(Error::CorruptDirectory {
                    dir: Default::default(),
                    reason: "in-progress segment does not have the largest start index".into(),
                });
            }
        }

        debug!("recovering {} segment file(s)", files.len());

        let mut segments = Vec::with_capacity(files.len());
        let mut expected_next_start: Option<u64> = None;

        for file in &files {
            if let Some(expected) = expected_next_start {
                if file.start_index() != expected {
                    return Err(Error::CorruptDirectory {
                        dir: Default::default(),
                        reason: format!(
                            "gap or overlap before segment {}: expected start {}",
                            file.start_index(),
                            expected
                        ),
                    });
                }
            }

            let segment = Self::load_segment(&repo, *file)?;
            expected_next_start = Some(segment.end_index().wrapping_add(1).max(segment.start_index()));
            segments.push(segment);
        }

        let head = match segments.last() {
            Some(tail) if tail.is_open() => {
                let file = repo.open_segment(SegmentFile::InProgress {
                    start_index: tail.start_index(),
                })?;
                Some(Head {
                    start_index: tail.start_index(),
                    file,
                })
            }
            _ => None,
        };

        Ok(Self {
            repo,
            opts,
            segments,
            head,
            compacted_watermark: -1,
            pending_since_sync: 0,
            last_sync_at: Instant::now(),
            closed: false,
            panicked: false,
        })
    }

    /// Create a brand new, empty log in `repo` (no segment files yet).
    pub fn create(repo: R, opts: Options) -> Self {
        Self {
            repo,
            opts,
            segments: Vec::new(),
            head: None,
            compacted_watermark: -1,
            pending_since_sync: 0,
            last_sync_at: Instant::now(),
            closed: false,
            panicked: false,
        }
    }

    fn load_segment(repo: &R, file: SegmentFile) -> Result<LogSegment, Error> {
        let mut storage = repo.open_segment(file)?;
        let mut magic = [0u8; SEGMENT_MAGIC.len()];
        let magic_len = match storage.read(&mut magic) {
            Ok(n) => n,
            Err(e) => return Err(Error::Io(e)),
        };
        if magic_len != SEGMENT_MAGIC.len() || &magic != SEGMENT_MAGIC {
            return Err(Error::CorruptSegment {
                path: Default::default(),
                offset: 0,
                source: DecodeError::Truncated {
                    need: SEGMENT_MAGIC.len(),
                    have: magic_len,
                },
            });
        }

        let start_index = file.start_index();
        let is_open = matches!(file, SegmentFile::InProgress { .. });
        let mut total_size = SEGMENT_MAGIC.len() as u64;
        let mut records = Vec::new();
        let mut next_index = start_index;

        loop {
            match codec::decode(&mut storage) {
                Ok(None) => break,
                Ok(Some(entry)) => {
                    let offset = total_size;
                    total_size += codec::frame_size(&entry) as u64;
                    next_index = entry.index + 1;
                    records.push(crate::segment::LogRecord { offset, entry });
                }
                Err(
                    e @ (DecodeError::Truncated { .. }
                    | DecodeError::ChecksumMismatch { .. }
                    | DecodeError::BadVarint
                    | DecodeError::FrameTooLarge { .. }),
                ) => {
                    if is_open {
                        warn!(
                            "torn tail in in-progress segment {start_index}: {e}; truncating to {total_size} bytes"
                        );
                        let mut file = repo.open_segment(file)?;
                        file.ftruncate(total_size)?;
                        break;
                    } else {
                        return Err(Error::CorruptSegment {
                            path: Default::default(),
                            offset: total_size,
                            source: e,
                        });
                    }
                }
                Err(DecodeError::Io(e)) => return Err(Error::Io(e)),
            }
        }

        if let SegmentFile::Sealed { end_index, .. } = file {
            if next_index != end_index + 1 {
                return Err(Error::CorruptDirectory {
                    dir: Default::default(),
                    reason: format!(
                        "sealed segment {start_index} declares end {end_index} but contains entries up to {}",
                        next_index.wrapping_sub(1)
                    ),
                });
            }
        }

        Ok(LogSegment::load(start_index, is_open, records, total_size))
    }

    /// `-1` if the log is empty, else the index of the last entry.
    pub fn last_index(&self) -> i64 {
        self.segments
            .iter()
            .rev()
            .find(|s| !s.is_empty())
            .map(|s| s.end_index() as i64)
            .unwrap_or(-1)
    }

    /// `0` if the log is empty, else the term of the last entry.
    pub fn last_term(&self) -> u64 {
        let idx = self.last_index();
        if idx < 0 {
            0
        } else {
            self.get(idx as u64).map(|e| e.term).unwrap_or(0)
        }
    }

    fn segment_index_for(&self, index: u64) -> Option<usize> {
        // Segments are disjoint and ordered by start_index (I5); binary
        // search for the one whose range could contain `index`.
        match self.segments.binary_search_by(|s| s.start_index().cmp(&index)) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    pub fn get(&self, index: u64) -> Option<LogEntry> {
        let i = self.segment_index_for(index)?;
        self.segments[i].get(index).cloned()
    }

    /// A lazy, single-pass, finite sequence of entries `[from, to]`. Stops
    /// early (before `to`) if an index in the range is missing.
    pub fn get_range(&self, from: u64, to: u64) -> GetRange<'_, R> {
        GetRange { log: self, next: from, to }
    }

    /// Validates and appends a single entry (§4.3). See module docs for the
    /// roll and sync policies this applies before returning.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ClosedLog);
        }

        let expected = match self.last_index() {
            -1 => entry.index,
            last => last as u64 + 1,
        };
        if entry.index != expected {
            return Err(Error::IndexGap {
                expected,
                actual: entry.index,
            });
        }

        self.ensure_open_head(entry.index)?;

        // Roll *before* this entry would push the tail over the threshold,
        // not after it already has (I7): a segment that already holds at
        // least one entry and would exceed `max_segment_size` by accepting
        // this one is sealed first, so the sealed file never exceeds the
        // bound. An empty tail always accepts the entry regardless of size,
        // so a single oversized entry can't loop forever rolling into empty
        // segments.
        let tail = self.segments.last().unwrap();
        if !tail.is_empty() {
            let prospective_size = tail.total_size() + codec::frame_size(&entry) as u64;
            if prospective_size > self.opts.max_segment_size {
                self.roll(entry.index)?;
            }
        }

        let tail = self.segments.last_mut().expect("ensured above");
        let records = tail.append(std::slice::from_ref(&entry))?;
        let record = records.into_iter().next().expect("exactly one record appended");

        self.panicked = true;
        let head = self.head.as_mut().expect("ensured above");
        debug_assert_eq!(head.start_index, tail.start_index());
        codec::encode(&entry, &mut head.file).map_err(Error::Io)?;
        trace!("appended entry {} at segment offset {}", entry.index, record.offset);
        self.panicked = false;

        self.apply_sync_policy()
    }

    fn ensure_open_head(&mut self, next_index: u64) -> Result<(), Error> {
        if self.head.is_some() {
            return Ok(());
        }
        trace!("opening new segment at {next_index}");
        let file = self.repo.create_open_segment(next_index)?;
        let mut file = file;
        file.write_all(SEGMENT_MAGIC)?;
        file.flush()?;
        self.segments.push(LogSegment::new_open(next_index));
        self.head = Some(Head {
            start_index: next_index,
            file,
        });
        Ok(())
    }

    fn roll(&mut self, next_index: u64) -> Result<(), Error> {
        self.seal_head()?;
        self.ensure_open_head(next_index)
    }

    fn seal_head(&mut self) -> Result<(), Error> {
        let head = self.head.take().expect("seal_head called with an open head");
        let tail = self.segments.last_mut().expect("head implies a tail segment");
        tail.close()?;
        let mut file = head.file;
        file.fsync()?;
        self.repo.seal_segment(head.start_index, tail.end_index())?;
        trace!("sealed segment {} (end_index={})", head.start_index, tail.end_index());
        Ok(())
    }

    fn apply_sync_policy(&mut self) -> Result<(), Error> {
        match self.opts.sync_mode {
            SyncMode::Always => self.fsync_head(),
            SyncMode::Batch { max_entries, max_interval } => {
                self.pending_since_sync += 1;
                if self.pending_since_sync >= max_entries || self.last_sync_at.elapsed() >= max_interval {
                    self.fsync_head()?;
                }
                Ok(())
            }
        }
    }

    fn fsync_head(&mut self) -> Result<(), Error> {
        if let Some(head) = self.head.as_mut() {
            head.file.fsync()?;
        }
        self.pending_since_sync = 0;
        self.last_sync_at = Instant::now();
        Ok(())
    }

    /// Force durability of everything appended so far (§5).
    pub fn flush(&mut self) -> Result<(), Error> {
        self.fsync_head()
    }

    /// Drop a suffix of the log so that `last_index() == from_index - 1`.
    ///
    /// The segment containing `from_index` is truncated and, unless it
    /// becomes empty, reopened for writes (see the open question in
    /// `SPEC_FULL.md` §9 this resolves); all later segments are deleted
    /// outright.
    pub fn truncate(&mut self, from_index: u64) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ClosedLog);
        }
        if (from_index as i64) <= self.compacted_watermark {
            return Err(Error::OutOfRange {
                index: from_index,
                watermark: self.compacted_watermark.max(0) as u64,
            });
        }

        let idx = match self.segment_index_for(from_index) {
            Some(idx) => idx,
            None => {
                return Err(Error::OutOfRange {
                    index: from_index,
                    watermark: 0,
                })
            }
        };

        // If the segment being truncated is the current head, drop the
        // cached write handle first; it (or its replacement) is re-derived
        // below.
        let truncated_was_head = self.head.as_ref().map(|h| h.start_index) == Some(self.segments[idx].start_index());
        if truncated_was_head {
            self.head = None;
        }

        // Delete every segment strictly after `idx`.
        while self.segments.len() > idx + 1 {
            let doomed = self.segments.pop().unwrap();
            let file = segment_file_on_disk(&doomed);
            warn!("truncate: removing segment {}", doomed.start_index());
            self.repo.remove_segment(file)?;
        }

        let was_open_on_disk = self.segments[idx].is_open() || truncated_was_head;
        let old_end_index = self.segments[idx].end_index();
        let old_start_index = self.segments[idx].start_index();

        let new_size = self.segments[idx].truncate(from_index)?;

        if self.segments[idx].is_empty() {
            // Open question 1: an emptied segment is deleted, not kept as a
            // zero-entry sealed file.
            let file = if was_open_on_disk {
                SegmentFile::InProgress { start_index: old_start_index }
            } else {
                SegmentFile::Sealed { start_index: old_start_index, end_index: old_end_index }
            };
            self.repo.remove_segment(file)?;
            self.segments.pop();
        } else {
            // Reopen the (now-shorter) segment so further appends can
            // proceed, per open question 2.
            if !was_open_on_disk {
                self.repo.unseal_segment(old_start_index, old_end_index)?;
            }
            let mut file = self
                .repo
                .open_segment(SegmentFile::InProgress { start_index: old_start_index })?;
            file.ftruncate(new_size)?;
            self.segments[idx].reopen();
            self.head = Some(Head {
                start_index: old_start_index,
                file,
            });
        }

        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        if self.head.is_some() {
            self.fsync_head()?;
        }
        self.closed = true;
        Ok(())
    }
}

/// Reconstruct the [`SegmentFile`] a (possibly stale) in-memory segment
/// currently corresponds to on disk, for deletion purposes.
fn segment_file_on_disk(segment: &LogSegment) -> SegmentFile {
    if segment.is_open() {
        SegmentFile::InProgress {
            start_index: segment.start_index(),
        }
    } else {
        SegmentFile::Sealed {
            start_index: segment.start_index(),
            end_index: segment.end_index(),
        }
    }
}

/// Iterator returned by [`SegmentedLog::get_range`].
pub struct GetRange<'a, R: Repo> {
    log: &'a SegmentedLog<R>,
    next: u64,
    to: u64,
}

impl<'a, R: Repo> Iterator for GetRange<'a, R> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if self.next > self.to {
            return None;
        }
        let entry = self.log.get(self.next)?;
        self.next += 1;
        Some(entry)
    }
}

impl<R: Repo> Drop for SegmentedLog<R> {
    fn drop(&mut self) {
        if self.panicked || std::thread::panicking() || self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            warn!("failed to flush segmented log on drop: {e}");
        }
    }
}
