//! Checkpoint data files.
//!
//! A checkpoint captures, for every OID, the newest version committed at or
//! before the checkpoint LSN. Restoring one recreates files and slots with
//! versions left in `Storage` state, pointing into the data file, so they are
//! read back only when first used.
//!
//! File layout (big-endian):
//!
//! ```text
//! header:  magic u32 | version u16 | reserved u16 | start u64 | nfiles u32
//! file:    fid u32 | flags u8 | name_len u16 | name | nentries u32 | entries
//! entry:   oid u32 | kind u8 | align u8 | clsn u64 | body
//!   object:    frame_len u32 | frame (padded to its size class)
//!   pointer:   raw u64
//!   directory: count u32 | oid u32 * count
//! trailer: crc32 u32 over everything before it
//! ```

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info};

use sable_common::constants::METADATA_FID;
use sable_common::{AddressSpace, Fid, Lsn, Oid, SizeCode, TaggedPtr};

use crate::array::{Head, OidDir};
use crate::error::{OidError, OidResult};
use crate::manager::OidManager;
use crate::object::{Object, ObjectFrame, ObjectStatus, PayloadSource};
use crate::snapshot::Snapshot;

const MAGIC: u32 = 0x5342_434b;
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 20;
const TRAILER_SIZE: usize = 4;

const FLAG_ALLOC: u8 = 1;

const KIND_OBJECT: u8 = 0;
const KIND_PTR: u8 = 1;
const KIND_DIR: u8 = 2;

/// What a checkpoint wrote or restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Checkpoint LSN.
    pub start: Lsn,
    /// Files captured.
    pub files: usize,
    /// Slots captured.
    pub entries: usize,
    /// Size of the data file.
    pub bytes: usize,
}

/// An open checkpoint data file serving lazy loads.
pub struct CheckpointFile {
    start: Lsn,
    path: PathBuf,
    file: Mutex<File>,
}

impl CheckpointFile {
    /// Opens a written data file for loads.
    pub fn open(path: &Path, start: Lsn) -> OidResult<Self> {
        Ok(Self {
            start,
            path: path.to_path_buf(),
            file: Mutex::new(File::open(path)?),
        })
    }

    /// Checkpoint LSN.
    pub fn start(&self) -> Lsn {
        self.start
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the frame `ptr` refers to.
    pub fn load(&self, ptr: TaggedPtr, align_bits: u8) -> OidResult<Bytes> {
        let offset = ptr.checkpoint_offset()?;
        let len = ptr.size(align_bits)?;
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl PayloadSource for CheckpointFile {
    fn load(&self, ptr: TaggedPtr, align_bits: u8) -> OidResult<Bytes> {
        CheckpointFile::load(self, ptr, align_bits)
    }
}

impl std::fmt::Debug for CheckpointFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointFile")
            .field("start", &self.start)
            .field("path", &self.path)
            .finish()
    }
}

/// Writes a checkpoint of `oids` as of `start` to `path`.
///
/// Versions still backed by an earlier checkpoint file are materialized first,
/// so that file can be removed once the new one is live.
pub fn write_checkpoint(
    path: &Path,
    oids: &OidManager,
    start: Lsn,
    source: &dyn PayloadSource,
) -> OidResult<CheckpointSummary> {
    let horizon = Snapshot::at(start);
    let fids: Vec<Fid> = oids
        .file_ids()
        .into_iter()
        .filter(|fid| fid.as_u32() != METADATA_FID)
        .collect();

    let mut buf = BytesMut::with_capacity(64 * 1024);
    buf.put_u32(MAGIC);
    buf.put_u16(VERSION);
    buf.put_u16(0);
    buf.put_u64(start.as_u64());
    buf.put_u32(fids.len() as u32);

    let mut entries = 0;
    for &fid in &fids {
        let file = oids.file(fid)?;
        let name = oids.file_name(fid).unwrap_or_default();
        buf.put_u32(fid.as_u32());
        buf.put_u8(if file.has_allocator() { FLAG_ALLOC } else { 0 });
        buf.put_u16(name.len() as u16);
        buf.put_slice(name.as_bytes());

        let count_at = buf.len();
        buf.put_u32(0);
        let mut count = 0u32;
        for (oid, head) in file.array().entries() {
            let written = match head.as_ref() {
                Head::Object(obj) => put_object(&mut buf, oid, obj, &horizon, source)?,
                Head::Ptr(ptr) => {
                    put_entry_header(&mut buf, oid, KIND_PTR, 0, 0);
                    buf.put_u64(ptr.as_u64());
                    true
                }
                Head::Dir(dir) => {
                    let list = dir.entries();
                    put_entry_header(&mut buf, oid, KIND_DIR, 0, 0);
                    buf.put_u32(list.len() as u32);
                    for entry in list {
                        buf.put_u32(entry.as_u32());
                    }
                    true
                }
            };
            count += u32::from(written);
        }
        buf[count_at..count_at + 4].copy_from_slice(&count.to_be_bytes());
        entries += count as usize;
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);

    let tmp = path.with_extension("tmp");
    {
        let mut out = File::create(&tmp)?;
        out.write_all(&buf)?;
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    let summary = CheckpointSummary {
        start,
        files: fids.len(),
        entries,
        bytes: buf.len(),
    };
    info!(?start, files = summary.files, entries, bytes = summary.bytes, "checkpoint written");
    Ok(summary)
}

fn put_entry_header(buf: &mut BytesMut, oid: Oid, kind: u8, align_bits: u8, clsn: u64) {
    buf.put_u32(oid.as_u32());
    buf.put_u8(kind);
    buf.put_u8(align_bits);
    buf.put_u64(clsn);
}

fn put_object(
    buf: &mut BytesMut,
    oid: Oid,
    head: &Arc<Object>,
    horizon: &Snapshot,
    source: &dyn PayloadSource,
) -> OidResult<bool> {
    let mut chosen: Option<Arc<Object>> = None;
    let mut cur = Some(Arc::clone(head));
    while let Some(obj) = cur {
        if obj.pdest().space() == Some(AddressSpace::Checkpoint) && obj.status() == ObjectStatus::Storage {
            obj.pin(source)?;
        }
        if chosen.is_none() && horizon.is_visible(&obj) {
            chosen = Some(Arc::clone(&obj));
        }
        cur = obj.next();
    }

    let Some(obj) = chosen else {
        return Ok(false);
    };
    let Some(data) = obj.data(source)? else {
        // Deleted as of the checkpoint.
        return Ok(false);
    };
    let clsn = obj.clsn().map_or(0, Lsn::as_u64);
    let align = obj.align_bits();
    let frame = ObjectFrame::encode(Some(&data), TaggedPtr::NULL);
    let padded = SizeCode::encode(frame.len(), align).decode(align)?;

    put_entry_header(buf, oid, KIND_OBJECT, align, clsn);
    buf.put_u32(padded as u32);
    buf.put_slice(&frame);
    buf.put_bytes(0, padded - frame.len());
    Ok(true)
}

/// Opens the checkpoint at `path` and restores it into `oids`.
pub fn restore_checkpoint(path: &Path, start: Lsn, oids: &OidManager) -> OidResult<(CheckpointFile, CheckpointSummary)> {
    let raw = fs::read(path)?;
    if raw.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(OidError::corrupt_checkpoint(start, "file shorter than its header"));
    }
    let body_len = raw.len() - TRAILER_SIZE;
    let stored = u32::from_be_bytes([raw[body_len], raw[body_len + 1], raw[body_len + 2], raw[body_len + 3]]);
    if crc32fast::hash(&raw[..body_len]) != stored {
        return Err(OidError::corrupt_checkpoint(start, "checksum mismatch"));
    }

    let mut cur = Cursor::new(&raw[..body_len], start);
    if cur.u32()? != MAGIC {
        return Err(OidError::corrupt_checkpoint(start, "bad magic"));
    }
    let version = cur.u16()?;
    if version != VERSION {
        return Err(OidError::corrupt_checkpoint(start, format!("unsupported version {version}")));
    }
    cur.u16()?;
    let recorded = Lsn::from_u64(cur.u64()?);
    if recorded != start {
        return Err(OidError::corrupt_checkpoint(start, format!("data file records {recorded:?}")));
    }

    let nfiles = cur.u32()? as usize;
    let mut entries = 0;
    for _ in 0..nfiles {
        let fid = Fid::new(cur.u32()?);
        let flags = cur.u8()?;
        let name_len = cur.u16()? as usize;
        let name = String::from_utf8(cur.bytes(name_len)?.to_vec())
            .map_err(|_| OidError::corrupt_checkpoint(start, format!("file name of {fid:?} is not UTF-8")))?;

        oids.recreate_file(fid, flags & FLAG_ALLOC != 0)?;
        if !name.is_empty() {
            oids.set_file_name(fid, &name, start)?;
        }

        let count = cur.u32()? as usize;
        for _ in 0..count {
            let oid = Oid::new(cur.u32()?);
            let kind = cur.u8()?;
            let align = cur.u8()?;
            let clsn = Lsn::from_u64(cur.u64()?);
            match kind {
                KIND_OBJECT => {
                    let len = cur.u32()? as usize;
                    let offset = cur.pos() as u64;
                    cur.bytes(len)?;
                    let code = SizeCode::encode(len, align);
                    if code.decode(align)? != len {
                        return Err(OidError::corrupt_checkpoint(start, format!("{oid:?} frame length {len} is not a size class")));
                    }
                    let ptr = TaggedPtr::checkpoint(offset, code)?;
                    oids.replay_version(fid, oid, Object::from_storage(ptr, clsn, align))?;
                }
                KIND_PTR => {
                    let ptr = TaggedPtr::from_u64(cur.u64()?);
                    oids.oid_put(fid, oid, Head::Ptr(ptr))?;
                }
                KIND_DIR => {
                    let n = cur.u32()? as usize;
                    let mut list = Vec::with_capacity(n);
                    for _ in 0..n {
                        list.push(Oid::new(cur.u32()?));
                    }
                    oids.oid_put(fid, oid, Head::Dir(Arc::new(OidDir::from_entries(list))))?;
                }
                other => {
                    return Err(OidError::corrupt_checkpoint(start, format!("unknown entry kind {other}")));
                }
            }
            entries += 1;
        }
    }
    if cur.remaining() != 0 {
        return Err(OidError::corrupt_checkpoint(start, "trailing bytes after the last file"));
    }

    let summary = CheckpointSummary {
        start,
        files: nfiles,
        entries,
        bytes: raw.len(),
    };
    debug!(?start, files = nfiles, entries, "checkpoint restored");

    Ok((CheckpointFile::open(path, start)?, summary))
}

struct Cursor<'a> {
    buf: &'a [u8],
    len: usize,
    start: Lsn,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], start: Lsn) -> Self {
        Self {
            buf,
            len: buf.len(),
            start,
        }
    }

    fn pos(&self) -> usize {
        self.len - self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> OidResult<()> {
        if self.buf.remaining() < n {
            return Err(OidError::corrupt_checkpoint(self.start, format!("truncated at byte {}", self.pos())));
        }
        Ok(())
    }

    fn u8(&mut self) -> OidResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> OidResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> OidResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> OidResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self, n: usize) -> OidResult<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}
