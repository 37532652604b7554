use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{FileLike, Repo, SegmentFile};

/// Width of the zero-padded decimal index in segment file names, chosen so
/// that lexicographic directory order matches numeric order (§6).
const INDEX_WIDTH: usize = 20;

fn format_index(index: u64) -> String {
    format!("{index:0width$}", width = INDEX_WIDTH)
}

fn sealed_name(start_index: u64, end_index: u64) -> String {
    format!("log-{}-{}", format_index(start_index), format_index(end_index))
}

fn in_progress_name(start_index: u64) -> String {
    format!("log-{}-inprogress", format_index(start_index))
}

fn parse_file_name(name: &str) -> Option<SegmentFile> {
    let rest = name.strip_prefix("log-")?;
    let (start, rest) = rest.split_once('-')?;
    let start_index: u64 = start.parse().ok()?;
    if rest == "inprogress" {
        return Some(SegmentFile::InProgress { start_index });
    }
    let end_index: u64 = rest.parse().ok()?;
    Some(SegmentFile::Sealed { start_index, end_index })
}

/// A [`Repo`] which stores segments as ordinary files in a directory.
#[derive(Clone)]
pub struct Fs {
    root: PathBuf,
}

impl fmt::Debug for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fs").field("root", &self.root).finish()
    }
}

impl fmt::Display for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())
    }
}

impl Fs {
    /// Open (creating if missing) a segment repository rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, file: SegmentFile) -> PathBuf {
        match file {
            SegmentFile::Sealed { start_index, end_index } => self.root.join(sealed_name(start_index, end_index)),
            SegmentFile::InProgress { start_index } => self.root.join(in_progress_name(start_index)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Repo for Fs {
    type Segment = File;

    fn create_open_segment(&self, start_index: u64) -> io::Result<Self::Segment> {
        let path = self.path_for(SegmentFile::InProgress { start_index });
        File::options().read(true).append(true).create_new(true).open(&path)
    }

    fn open_segment(&self, file: SegmentFile) -> io::Result<Self::Segment> {
        // `.append(true)`, not `.write(true)`: this handle doubles as the
        // writable head after recovery and after `truncate` (`SegmentedLog`
        // never seeks before writing a frame), so writes must always land at
        // the current end of file regardless of where a prior read left the
        // cursor. Plain `.write(true)` would let the first post-recovery
        // append overwrite `SEGMENT_MAGIC`/existing frames instead.
        File::options().read(true).append(true).open(self.path_for(file))
    }

    fn seal_segment(&self, start_index: u64, end_index: u64) -> io::Result<()> {
        let from = self.path_for(SegmentFile::InProgress { start_index });
        let to = self.path_for(SegmentFile::Sealed { start_index, end_index });
        debug!("sealing segment {start_index} as {}", to.display());
        fs::rename(from, to)
    }

    fn unseal_segment(&self, start_index: u64, end_index: u64) -> io::Result<()> {
        let from = self.path_for(SegmentFile::Sealed { start_index, end_index });
        let to = self.path_for(SegmentFile::InProgress { start_index });
        debug!("unsealing segment {start_index} back to {}", to.display());
        fs::rename(from, to)
    }

    fn remove_segment(&self, file: SegmentFile) -> io::Result<()> {
        let path = self.path_for(file);
        warn!("removing segment file {}", path.display());
        fs::remove_file(path)
    }

    fn existing_segments(&self) -> io::Result<Vec<SegmentFile>> {
        let mut segments = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if let Some(segment) = parse_file_name(&name) {
                segments.push(segment);
            }
        }

        Ok(segments)
    }
}
