//! End-to-end scenarios against a real filesystem-backed [`Repo`], covering
//! the concrete scenarios enumerated in the segmented log's design notes:
//! segment rolling, cross-segment truncation, torn-tail recovery, and
//! rejection of a corrupt sealed segment.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::time::Duration;

use once_cell::sync::Lazy;

use raft_segmented_log::repo::Fs;
use raft_segmented_log::{LogEntry, Options, SegmentedLog, SyncMode};

/// Initialized once across the whole test binary, the same way the teacher's
/// own test harness guards `env_logger::init` behind a lazy static rather
/// than each test racing `try_init`.
static LOGGING: Lazy<()> = Lazy::new(|| {
    env_logger::builder().is_test(true).init();
});

fn enable_logging() {
    Lazy::force(&LOGGING);
}

fn always_sync(max_segment_size: u64) -> Options {
    Options {
        max_segment_size,
        sync_mode: SyncMode::Always,
    }
}

fn entry(index: u64, term: u64, payload: &[u8]) -> LogEntry {
    LogEntry::new(index, term, payload.to_vec())
}

#[test]
fn append_then_read() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path()).unwrap();
    let mut log = SegmentedLog::create(repo, Options::default());

    log.append(entry(0, 1, b"a")).unwrap();
    log.append(entry(1, 1, b"b")).unwrap();
    log.append(entry(2, 2, b"c")).unwrap();

    let got = log.get(1).unwrap();
    assert_eq!(got.term, 1);
    assert_eq!(got.payload, b"b");
    assert_eq!(log.last_index(), 2);
    assert_eq!(log.last_term(), 2);
}

#[test]
fn segment_roll_produces_expected_files_and_preserves_order() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path()).unwrap();
    let mut log = SegmentedLog::create(repo, always_sync(128));

    for i in 0..10u64 {
        log.append(entry(i, 1, &vec![0u8; 20])).unwrap();
    }
    log.close().unwrap();

    let collected: Vec<_> = (0..10).map(|i| log.get(i).unwrap()).collect();
    assert_eq!(collected.len(), 10);
    for (i, e) in collected.iter().enumerate() {
        assert_eq!(e.index, i as u64);
    }

    let mut names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert!(names.len() >= 2, "expected at least 2 files, got {names:?}");
    let sealed_count = names.iter().filter(|n| !n.ends_with("inprogress")).count();
    let in_progress_count = names.len() - sealed_count;
    assert!(sealed_count >= 1, "expected at least one sealed segment, got {names:?}");
    assert_eq!(in_progress_count, 1, "expected exactly one in-progress segment, got {names:?}");
}

#[test]
fn truncate_across_segments_drops_later_files_and_reopens_the_boundary_one() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path()).unwrap();
    let mut log = SegmentedLog::create(repo, always_sync(128));

    for i in 0..10u64 {
        log.append(entry(i, 1, &vec![0u8; 20])).unwrap();
    }
    let files_before = std::fs::read_dir(dir.path()).unwrap().count();
    assert!(files_before > 2, "test expects the 10 entries to span more than 2 segments");

    log.truncate(3).unwrap();
    assert_eq!(log.last_index(), 2);
    for i in 0..3u64 {
        assert!(log.get(i).is_some());
    }
    for i in 3..10u64 {
        assert!(log.get(i).is_none());
    }

    // Every segment file whose start index is at or after the segment
    // containing `from_index` is gone; only the (possibly truncated, now
    // in-progress) boundary segment and anything strictly before it survive.
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.len() < files_before, "truncate should have removed files: {names:?}");
    let in_progress_count = names.iter().filter(|n| n.ends_with("inprogress")).count();
    assert_eq!(in_progress_count, 1, "exactly one in-progress file should remain: {names:?}");

    // Further appends succeed against the reopened segment.
    log.append(entry(3, 2, b"resumed")).unwrap();
    assert_eq!(log.last_index(), 3);
    assert_eq!(log.last_term(), 2);
    assert_eq!(log.get(3).unwrap().payload, b"resumed");

    // Close and reopen from disk: the post-truncate append must have been
    // written *after* the entries that survived the truncation, not over
    // them -- a repo that opens the reused in-progress file without append
    // mode would have clobbered the file's header/earlier frames here.
    log.close().unwrap();
    drop(log);
    let repo = Fs::new(dir.path()).unwrap();
    let reopened = SegmentedLog::open(repo, always_sync(128)).unwrap();
    assert_eq!(reopened.last_index(), 3);
    assert_eq!(reopened.last_term(), 2);
    for i in 0..3u64 {
        assert_eq!(reopened.get(i).unwrap().payload, vec![0u8; 20]);
    }
    assert_eq!(reopened.get(3).unwrap().payload, b"resumed");

    // And the round-trip survives a second close/open cycle too, confirming
    // the reopened file itself is in a consistent, re-recoverable state.
    drop(reopened);
    let repo = Fs::new(dir.path()).unwrap();
    let reopened_again = SegmentedLog::open(repo, always_sync(128)).unwrap();
    assert_eq!(reopened_again.last_index(), 3);
    assert_eq!(reopened_again.get(3).unwrap().payload, b"resumed");
}

#[test]
fn torn_tail_is_truncated_on_reopen() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let repo = Fs::new(dir.path()).unwrap();
        let mut log = SegmentedLog::create(repo, always_sync(u64::MAX));
        for i in 0..5u64 {
            log.append(entry(i, 1, b"payload")).unwrap();
        }
        log.close().unwrap();
    }

    let path = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().ends_with("inprogress"))
        .expect("one in-progress segment on disk");

    let good_len = std::fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(good_len - 3).unwrap();
    file.seek(SeekFrom::End(0)).unwrap();
    file.write_all(&[0xff, 0xff, 0xff]).unwrap();
    drop(file);

    let repo = Fs::new(dir.path()).unwrap();
    let log = SegmentedLog::open(repo, Options::default()).unwrap();

    assert_eq!(log.last_index(), 3);
    assert!(log.get(4).is_none());

    let truncated_len = std::fs::metadata(&path).unwrap().len();
    assert!(truncated_len < good_len, "file should have been truncated back");
}

#[test]
fn torn_tail_at_random_byte_length_recovers_the_longest_valid_prefix() {
    enable_logging();

    for _ in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        let payload_len: usize = rand::random_range(1..32);
        let payload = vec![0xabu8; payload_len];

        {
            let repo = Fs::new(dir.path()).unwrap();
            let mut log = SegmentedLog::create(repo, always_sync(u64::MAX));
            for i in 0..8u64 {
                log.append(entry(i, 1, &payload)).unwrap();
            }
            log.close().unwrap();
        }

        let path = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().unwrap().to_string_lossy().ends_with("inprogress"))
            .expect("one in-progress segment on disk");
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Truncate to a random byte length within the file; this may or may
        // not land on a frame boundary, but crash recovery must never accept
        // a partially-present entry regardless of where it lands.
        let cut_at: u64 = rand::random_range(8..good_len);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(cut_at).unwrap();
        drop(file);

        let repo = Fs::new(dir.path()).unwrap();
        let log = SegmentedLog::open(repo, Options::default()).unwrap();

        // Every entry the reopened log reports must have been fully present
        // in the truncated file, and indices must remain gap-free from 0.
        for i in 0..=log.last_index().max(-1) {
            let got = log.get(i as u64);
            assert!(got.is_some(), "entry {i} missing after recovery at cut_at={cut_at}");
        }
        assert!(log.get((log.last_index() + 1) as u64).is_none());
    }
}

#[test]
fn corrupt_sealed_segment_is_rejected() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let repo = Fs::new(dir.path()).unwrap();
        let mut log = SegmentedLog::create(repo, always_sync(128));
        for i in 0..10u64 {
            log.append(entry(i, 1, &vec![0u8; 20])).unwrap();
        }
        log.close().unwrap();
    }

    let sealed = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| !p.file_name().unwrap().to_string_lossy().ends_with("inprogress"))
        .expect("at least one sealed segment");

    // Flip a bit well past the magic header, inside the first frame's body.
    let mut file = OpenOptions::new().read(true).write(true).open(&sealed).unwrap();
    file.seek(SeekFrom::Start(20)).unwrap();
    let mut byte = [0u8; 1];
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(20)).unwrap();
    file.write_all(&byte).unwrap();
    drop(file);

    let repo = Fs::new(dir.path()).unwrap();
    let err = SegmentedLog::open(repo, Options::default()).unwrap_err();
    assert!(matches!(err, raft_segmented_log::error::Error::CorruptSegment { .. }));
}

/// Base-128 varint encoding, duplicated here (rather than exposed from the
/// crate) purely to hand-craft a malicious length prefix byte-for-byte.
fn encode_varint_for_test(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        if value < 0x80 {
            out.push(value as u8);
            return out;
        }
        out.push(((value & 0x7f) | 0x80) as u8);
        value >>= 7;
    }
}

#[test]
fn oversized_length_prefix_in_sealed_segment_is_rejected_without_allocating() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();

    // Hand-craft a sealed segment file whose very first frame declares a
    // body length far past `MAX_FRAME_BODY_LEN`. No body/checksum bytes
    // follow -- if recovery ever got as far as allocating or reading the
    // declared length, this test would hang or abort the process instead of
    // returning an error quickly.
    let huge_len = raft_segmented_log::codec::MAX_FRAME_BODY_LEN as u64 + 1_000_000;
    let mut bytes = raft_segmented_log::segment::SEGMENT_MAGIC.to_vec();
    bytes.extend(encode_varint_for_test(huge_len));

    let path = dir.path().join(format!("log-{:020}-{:020}", 0, 0));
    std::fs::write(&path, &bytes).unwrap();

    let repo = Fs::new(dir.path()).unwrap();
    let err = SegmentedLog::open(repo, Options::default()).unwrap_err();
    match err {
        raft_segmented_log::error::Error::CorruptSegment { source, .. } => {
            assert!(matches!(source, raft_segmented_log::error::DecodeError::FrameTooLarge { .. }));
        }
        other => panic!("expected CorruptSegment, got {other:?}"),
    }
}

#[test]
fn index_gap_is_rejected_and_state_unchanged() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path()).unwrap();
    let mut log = SegmentedLog::create(repo, Options::default());

    for i in 0..3u64 {
        log.append(entry(i, 1, b"x")).unwrap();
    }

    let err = log.append(entry(4, 1, b"y")).unwrap_err();
    assert!(matches!(
        err,
        raft_segmented_log::error::Error::IndexGap {
            expected: 3,
            actual: 4
        }
    ));
    assert_eq!(log.last_index(), 2);
}

#[test]
fn close_then_reopen_preserves_state() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let repo = Fs::new(dir.path()).unwrap();
        let mut log = SegmentedLog::create(repo, always_sync(256));
        for i in 0..20u64 {
            log.append(entry(i, (i / 7) + 1, &vec![7u8; 10])).unwrap();
        }
        log.close().unwrap();
    }

    let repo = Fs::new(dir.path()).unwrap();
    let log = SegmentedLog::open(repo, Options::default()).unwrap();
    assert_eq!(log.last_index(), 19);
    for i in 0..20u64 {
        let got = log.get(i).unwrap();
        assert_eq!(got.index, i);
        assert_eq!(got.term, (i / 7) + 1);
    }
}

#[test]
fn batch_sync_requires_explicit_flush_for_durability() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let repo = Fs::new(dir.path()).unwrap();
    let opts = Options {
        max_segment_size: Options::default().max_segment_size,
        sync_mode: SyncMode::Batch {
            max_entries: 1_000_000,
            max_interval: Duration::from_secs(3600),
        },
    };
    let mut log = SegmentedLog::create(repo, opts);
    log.append(entry(0, 1, b"a")).unwrap();
    log.flush().unwrap();
    assert_eq!(log.last_index(), 0);
}
