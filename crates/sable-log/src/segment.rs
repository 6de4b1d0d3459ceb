//! Log segment management.
//!
//! A segment is one file backing the byte range `[start, end)` of the logical
//! log. Segments are contiguous and numbered in creation order; only the
//! newest one receives appends.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use sable_common::constants::FIRST_SEGMENT_NUMBER;
use sable_common::Lsn;

use crate::error::{LogError, LogResult};

/// A single segment file.
pub struct Segment {
    segnum: u32,
    start: u64,
    end: u64,
    path: PathBuf,
    file: Mutex<File>,
}

impl Segment {
    /// Creates the file for a new segment, or opens it if it already exists.
    pub fn create(dir: &Path, segnum: u32, start: u64, end: u64) -> LogResult<Self> {
        let path = dir.join(Self::file_name(segnum, start, end));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        debug!(segnum, start, end, "created log segment");
        Ok(Self {
            segnum,
            start,
            end,
            path,
            file: Mutex::new(file),
        })
    }

    /// Opens an existing segment file, taking its range from the file name.
    pub fn open(path: impl AsRef<Path>) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (segnum, start, end) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse_file_name)
            .ok_or_else(|| LogError::BadFileName { path: path.clone() })?;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(Self {
            segnum,
            start,
            end,
            path,
            file: Mutex::new(file),
        })
    }

    /// File name for a segment: `log-<segnum>-<start>-<end>` in hex.
    pub fn file_name(segnum: u32, start: u64, end: u64) -> String {
        format!("log-{segnum:08x}-{start:012x}-{end:012x}")
    }

    /// Parses a segment file name into `(segnum, start, end)`.
    pub fn parse_file_name(name: &str) -> Option<(u32, u64, u64)> {
        let mut parts = name.strip_prefix("log-")?.split('-');
        let segnum = u32::from_str_radix(parts.next()?, 16).ok()?;
        let start = u64::from_str_radix(parts.next()?, 16).ok()?;
        let end = u64::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() || end <= start {
            return None;
        }
        Some((segnum, start, end))
    }

    /// Returns the segment number.
    pub fn segnum(&self) -> u32 {
        self.segnum
    }

    /// First log offset covered by this segment.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last log offset covered by this segment.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Returns true if `offset` falls inside `[start, end)`.
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// LSN of a log offset inside this segment.
    pub fn lsn(&self, offset: u64) -> Lsn {
        Lsn::make(offset, self.segnum)
    }

    /// Returns the path to this segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the file in bytes.
    pub fn file_len(&self) -> LogResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Reads up to `buf.len()` bytes at log offset `offset`.
    ///
    /// Returns the number of bytes read, which is short at the end of the file
    /// or at the segment end.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> LogResult<usize> {
        if !self.contains(offset) {
            return Ok(0);
        }
        let limit = buf.len().min((self.end - offset) as usize);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset - self.start))?;

        let mut filled = 0;
        while filled < limit {
            match file.read(&mut buf[filled..limit]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Writes `data` at log offset `offset`. A partial write is an error.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> LogResult<()> {
        if offset < self.start || offset + data.len() as u64 > self.end {
            return Err(LogError::invariant(format!(
                "write of {} bytes at {offset:#x} outside segment {} [{:#x}, {:#x})",
                data.len(),
                self.segnum,
                self.start,
                self.end
            )));
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset - self.start))?;
        let written = file.write(data)?;
        if written != data.len() {
            return Err(LogError::ShortWrite {
                segnum: self.segnum,
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    /// Syncs the segment to disk.
    pub fn sync(&self) -> LogResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Cuts the file so that it ends at log offset `offset`.
    pub fn truncate_at(&self, offset: u64) -> LogResult<()> {
        let len = offset.saturating_sub(self.start);
        let file = self.file.lock();
        if file.metadata()?.len() > len {
            file.set_len(len)?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("segnum", &self.segnum)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("path", &self.path)
            .finish()
    }
}

/// The ordered set of live segments.
pub struct SegmentTable {
    dir: PathBuf,
    segment_size: u64,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentTable {
    /// Loads every segment file in `dir`, creating the first segment if none exist.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut segments = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("log-") {
                segments.push(Arc::new(Segment::open(entry.path())?));
            }
        }
        segments.sort_by_key(|s| s.segnum());

        for pair in segments.windows(2) {
            if pair[1].segnum() != pair[0].segnum() + 1 || pair[1].start() != pair[0].end() {
                return Err(LogError::invariant(format!(
                    "segments {} and {} are not contiguous",
                    pair[0].segnum(),
                    pair[1].segnum()
                )));
            }
        }

        if segments.is_empty() {
            let first = Segment::create(&dir, FIRST_SEGMENT_NUMBER, 0, segment_size)?;
            info!(path = %first.path().display(), "created first log segment");
            segments.push(Arc::new(first));
        }

        Ok(Self {
            dir,
            segment_size,
            segments: RwLock::new(segments),
        })
    }

    /// Returns the newest segment, the only one open for append.
    pub fn newest(&self) -> Arc<Segment> {
        let segments = self.segments.read();
        Arc::clone(&segments[segments.len() - 1])
    }

    /// Returns the oldest live segment.
    pub fn oldest(&self) -> Arc<Segment> {
        Arc::clone(&self.segments.read()[0])
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    /// Always false; a table holds at least one segment.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the segment covering `offset`.
    pub fn for_offset(&self, offset: u64) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let idx = segments.partition_point(|s| s.end() <= offset);
        segments.get(idx).filter(|s| s.contains(offset)).cloned()
    }

    /// Returns the segment covering `lsn`, checking the segment tag.
    pub fn for_lsn(&self, lsn: Lsn) -> Option<Arc<Segment>> {
        self.for_offset(lsn.offset())
            .filter(|s| lsn.in_segment(s.segnum()))
    }

    /// Builds the LSN for a log offset.
    ///
    /// An offset at the end of the newest segment maps to that segment.
    pub fn make_lsn(&self, offset: u64) -> LogResult<Lsn> {
        if let Some(segment) = self.for_offset(offset) {
            return Ok(segment.lsn(offset));
        }
        let newest = self.newest();
        if offset == newest.end() {
            return Ok(newest.lsn(offset));
        }
        Err(LogError::invariant(format!(
            "no segment covers offset {offset:#x}"
        )))
    }

    /// Creates the segment that follows the newest one.
    pub fn create_next(&self) -> LogResult<Arc<Segment>> {
        let mut segments = self.segments.write();
        let newest = &segments[segments.len() - 1];
        let (segnum, start) = (newest.segnum() + 1, newest.end());

        let segment = Arc::new(Segment::create(
            &self.dir,
            segnum,
            start,
            start + self.segment_size,
        )?);
        info!(segnum, start, "opened new log segment");
        segments.push(Arc::clone(&segment));
        Ok(segment)
    }

    /// Reads raw bytes at `lsn`, bounded by the segment end and the file length.
    pub fn read(&self, lsn: Lsn, buf: &mut [u8]) -> LogResult<usize> {
        match self.for_lsn(lsn) {
            Some(segment) => segment.read_at(lsn.offset(), buf),
            None => Ok(0),
        }
    }

    /// Discards every byte at or after `offset`.
    ///
    /// Segments starting after `offset` are deleted; the segment holding it is
    /// cut. When `offset` is the end of the newest segment, the next segment is
    /// created so that appends can continue.
    pub fn truncate_after(&self, offset: u64) -> LogResult<()> {
        {
            let mut segments = self.segments.write();
            while segments.len() > 1 && segments[segments.len() - 1].start() > offset {
                if let Some(segment) = segments.pop() {
                    info!(segnum = segment.segnum(), "removing log segment past durable end");
                    fs::remove_file(segment.path())?;
                }
            }
        }

        let newest = self.newest();
        if newest.contains(offset) {
            newest.truncate_at(offset)?;
        } else if offset == newest.end() {
            self.create_next()?;
        } else {
            return Err(LogError::invariant(format!(
                "durable offset {offset:#x} outside every segment"
            )));
        }
        Ok(())
    }

    /// Syncs every segment overlapping `[begin, end)`.
    pub fn sync_range(&self, begin: u64, end: u64) -> LogResult<()> {
        let segments = self.segments.read();
        for segment in segments
            .iter()
            .filter(|s| s.start() < end && begin < s.end())
        {
            segment.sync()?;
        }
        Ok(())
    }

    /// Writes `data` starting at log offset `offset`, splitting at segment boundaries.
    pub fn write(&self, mut offset: u64, mut data: &[u8]) -> LogResult<()> {
        while !data.is_empty() {
            let segment = self
                .for_offset(offset)
                .ok_or_else(|| LogError::invariant(format!("no segment for offset {offset:#x}")))?;
            let n = data.len().min((segment.end() - offset) as usize);
            segment.write_at(offset, &data[..n])?;
            offset += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Returns the log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the configured segment size.
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

impl std::fmt::Debug for SegmentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTable")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("segments", &self.len())
            .finish()
    }
}
