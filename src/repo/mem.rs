use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use super::{FileLike, Repo, SegmentFile};

type SharedLock<T> = Arc<RwLock<T>>;
type SharedBytes = SharedLock<Vec<u8>>;

/// A segment backed by a `Vec<u8>`, used in tests in place of a real file.
///
/// Writes always append, like a file opened with `O_APPEND`, regardless of
/// the current read position.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pos: u64,
    buf: SharedBytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.buf.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable access to the underlying buffer, for tests that deliberately
    /// corrupt segment data.
    pub fn buf_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.write().unwrap()
    }
}

impl FileLike for Segment {
    fn fsync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn ftruncate(&mut self, size: u64) -> io::Result<()> {
        let mut inner = self.buf.write().unwrap();
        inner.resize(size as usize, 0);
        Ok(())
    }
}

impl io::Write for Segment {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.buf.write().unwrap();
        inner.extend_from_slice(buf);
        self.pos = inner.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Segment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.buf.read().unwrap();
        let pos = self.pos as usize;
        if pos > inner.len() {
            return Err(io::Error::from_raw_os_error(9));
        }
        let n = io::Read::read(&mut &inner[pos..], buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl io::Seek for Segment {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base_pos, offset) = match pos {
            io::SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            io::SeekFrom::End(n) => (self.len() as u64, n),
            io::SeekFrom::Current(n) => (self.pos, n),
        };
        match base_pos.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

struct Entry {
    buf: SharedBytes,
    end_index: Option<u64>,
}

/// An in-memory [`Repo`], for unit and property tests.
#[derive(Clone, Default)]
pub struct Memory(SharedLock<BTreeMap<u64, Entry>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the raw segment for `start_index`, for tests that corrupt data
    /// in place.
    pub fn segment(&self, start_index: u64) -> Option<Segment> {
        self.0
            .read()
            .unwrap()
            .get(&start_index)
            .map(|entry| Segment {
                pos: 0,
                buf: entry.buf.clone(),
            })
    }
}

impl Repo for Memory {
    type Segment = Segment;

    fn create_open_segment(&self, start_index: u64) -> io::Result<Self::Segment> {
        let mut map = self.0.write().unwrap();
        if map.contains_key(&start_index) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "segment exists"));
        }
        let buf: SharedBytes = Arc::new(RwLock::new(Vec::new()));
        map.insert(
            start_index,
            Entry {
                buf: buf.clone(),
                end_index: None,
            },
        );
        Ok(Segment { pos: 0, buf })
    }

    fn open_segment(&self, file: SegmentFile) -> io::Result<Self::Segment> {
        let map = self.0.read().unwrap();
        map.get(&file.start_index())
            .map(|entry| Segment {
                pos: 0,
                buf: entry.buf.clone(),
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such segment"))
    }

    fn seal_segment(&self, start_index: u64, end_index: u64) -> io::Result<()> {
        let mut map = self.0.write().unwrap();
        let entry = map
            .get_mut(&start_index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such segment"))?;
        entry.end_index = Some(end_index);
        Ok(())
    }

    fn unseal_segment(&self, start_index: u64, _end_index: u64) -> io::Result<()> {
        let mut map = self.0.write().unwrap();
        let entry = map
            .get_mut(&start_index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such segment"))?;
        entry.end_index = None;
        Ok(())
    }

    fn remove_segment(&self, file: SegmentFile) -> io::Result<()> {
        self.0
            .write()
            .unwrap()
            .remove(&file.start_index())
            .map(drop)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such segment"))
    }

    fn existing_segments(&self) -> io::Result<Vec<SegmentFile>> {
        Ok(self
            .0
            .read()
            .unwrap()
            .iter()
            .map(|(&start_index, entry)| match entry.end_index {
                Some(end_index) => SegmentFile::Sealed { start_index, end_index },
                None => SegmentFile::InProgress { start_index },
            })
            .collect())
    }
}
