//! Log space allocation and flushing.
//!
//! Every block gets a contiguous range of log offsets from a single allocation
//! point. Ranges handed out but not yet filled are tracked as outstanding; the
//! flusher writes only the prefix of the buffer that precedes the oldest
//! outstanding range, so a block is never made durable half-written.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use sable_common::constants::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use sable_common::Lsn;

use crate::block::encode_skip;
use crate::buffer::WindowBuffer;
use crate::config::{LogConfig, SyncPolicy};
use crate::error::{LogError, LogResult};
use crate::marks::DurableMark;
use crate::segment::SegmentTable;
use crate::stats::LogStats;

const ROOM_WAIT: Duration = Duration::from_millis(1);

/// A reserved range of the log, `[lsn, next_lsn)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First byte of the range.
    pub lsn: Lsn,
    /// One past the last byte; the LSN of whatever follows.
    pub next_lsn: Lsn,
}

impl Allocation {
    /// Size of the range in bytes.
    pub fn size(&self) -> usize {
        (self.next_lsn.offset() - self.lsn.offset()) as usize
    }
}

struct AllocState {
    cur: u64,
    outstanding: BTreeSet<u64>,
}

/// Hands out log ranges and moves filled ranges to segment files.
pub struct LogAllocator {
    segments: Arc<SegmentTable>,
    buffer: WindowBuffer,
    state: Mutex<AllocState>,
    room: Condvar,
    durable: AtomicU64,
    durable_mark: DurableMark,
    flush_lock: Mutex<()>,
    failed: AtomicBool,
    sync: bool,
    stats: Arc<LogStats>,
}

impl LogAllocator {
    /// Creates an allocator whose log ends at `start`, all of it durable.
    pub fn new(
        config: &LogConfig,
        segments: Arc<SegmentTable>,
        durable_mark: DurableMark,
        start: u64,
        stats: Arc<LogStats>,
    ) -> Self {
        Self {
            segments,
            buffer: WindowBuffer::new(config.buffer_size, start),
            state: Mutex::new(AllocState {
                cur: start,
                outstanding: BTreeSet::new(),
            }),
            room: Condvar::new(),
            durable: AtomicU64::new(start),
            durable_mark,
            flush_lock: Mutex::new(()),
            failed: AtomicBool::new(false),
            sync: config.sync_policy != SyncPolicy::Never,
            stats,
        }
    }

    /// Reserves `size` bytes of log.
    ///
    /// When the range would cross the end of the active segment, the remainder
    /// of that segment is closed with a skip block and the range is placed at
    /// the start of a new segment.
    pub fn allocate(&self, size: usize) -> LogResult<Allocation> {
        self.check_failed()?;
        if size > MAX_BLOCK_SIZE {
            return Err(LogError::BlockTooLarge {
                size,
                max: MAX_BLOCK_SIZE,
            });
        }
        if size < MIN_BLOCK_SIZE {
            return Err(LogError::invariant(format!("block of {size} bytes is too small")));
        }

        let (alloc, skip) = {
            let mut state = self.state.lock();
            let active = self.segments.newest();
            let off = state.cur;
            let end = off + size as u64;

            if end + MIN_BLOCK_SIZE as u64 <= active.end() {
                state.cur = end;
                state.outstanding.insert(off);
                let alloc = Allocation {
                    lsn: active.lsn(off),
                    next_lsn: active.lsn(end),
                };
                (alloc, None)
            } else {
                let next = self.segments.create_next()?;
                LogStats::bump(&self.stats.segments_created);
                let skip = Allocation {
                    lsn: active.lsn(off),
                    next_lsn: next.lsn(next.start()),
                };
                let start = next.start();
                state.cur = start + size as u64;
                state.outstanding.insert(off);
                state.outstanding.insert(start);
                let alloc = Allocation {
                    lsn: next.lsn(start),
                    next_lsn: next.lsn(state.cur),
                };
                (alloc, Some(skip))
            }
        };

        if let Some(skip) = skip {
            debug!(at = ?skip.lsn, next = ?skip.next_lsn, "closing segment with skip block");
            self.fill_skip(&skip)?;
        }
        Ok(alloc)
    }

    /// Copies a finished block into its range and releases the range.
    pub fn publish(&self, alloc: &Allocation, block: &[u8]) -> LogResult<()> {
        let result = self.write_range(alloc, block);
        self.release(alloc.lsn.offset());
        if result.is_ok() {
            self.stats.record_block();
        }
        result
    }

    /// Fills a range with a skip block and releases it.
    pub fn fill_skip(&self, alloc: &Allocation) -> LogResult<()> {
        let result = encode_skip(alloc.lsn, alloc.next_lsn).and_then(|b| self.write_range(alloc, &b));
        self.release(alloc.lsn.offset());
        result
    }

    fn write_range(&self, alloc: &Allocation, block: &[u8]) -> LogResult<()> {
        if block.len() != alloc.size() {
            return Err(LogError::invariant(format!(
                "block of {} bytes published into a {}-byte range",
                block.len(),
                alloc.size()
            )));
        }
        self.wait_for_room(alloc.next_lsn.offset())?;
        self.buffer.write_at(alloc.lsn.offset(), block)
    }

    fn release(&self, offset: u64) {
        let mut state = self.state.lock();
        state.outstanding.remove(&offset);
        self.room.notify_all();
    }

    /// Blocks until the buffer can hold bytes up to `end`.
    fn wait_for_room(&self, end: u64) -> LogResult<()> {
        while !self.buffer.has_room(end) {
            self.check_failed()?;
            self.flush()?;
            let mut state = self.state.lock();
            if !self.buffer.has_room(end) {
                self.room.wait_for(&mut state, ROOM_WAIT);
            }
        }
        Ok(())
    }

    /// Appends bytes shipped from another log at `start`.
    ///
    /// The bytes must continue this log exactly; segments are opened as the
    /// shipped range crosses their ends.
    pub fn append_raw(&self, start: u64, bytes: &[u8]) -> LogResult<()> {
        self.check_failed()?;
        let chunk = self.buffer.capacity() / 2;
        let mut at = start;
        for piece in bytes.chunks(chunk.max(1)) {
            let end = at + piece.len() as u64;
            let alloc = {
                let mut state = self.state.lock();
                if at != state.cur {
                    return Err(LogError::NotContiguous {
                        start: self.segments.make_lsn(at).unwrap_or(Lsn::INVALID),
                        expected: self.segments.make_lsn(state.cur)?,
                    });
                }
                while self.segments.newest().end() <= end {
                    self.segments.create_next()?;
                    LogStats::bump(&self.stats.segments_created);
                }
                state.cur = end;
                state.outstanding.insert(at);
                Allocation {
                    lsn: Lsn::make(at, 0),
                    next_lsn: Lsn::make(end, 0),
                }
            };
            let result = self.write_range(&alloc, piece);
            self.release(at);
            result?;
            at = end;
        }
        Ok(())
    }

    /// Writes everything that is fully filled to segment files.
    ///
    /// Returns the durable offset afterwards.
    pub fn flush(&self) -> LogResult<u64> {
        let _guard = self.flush_lock.lock();
        self.check_failed()?;

        let begin = self.durable.load(Ordering::Acquire);
        let end = {
            let state = self.state.lock();
            state.outstanding.first().copied().unwrap_or(state.cur)
        };
        if end <= begin {
            return Ok(begin);
        }

        if let Err(e) = self.write_out(begin, end) {
            self.failed.store(true, Ordering::Release);
            error!(error = %e, begin, end, "log flush failed; log disabled");
            return Err(e);
        }

        self.durable.store(end, Ordering::Release);
        self.buffer.advance_reader(end)?;
        self.durable_mark.update(self.segments.make_lsn(end)?)?;
        self.stats.record_flush(end - begin);
        self.room.notify_all();
        Ok(end)
    }

    fn write_out(&self, begin: u64, end: u64) -> LogResult<()> {
        self.buffer.advance_writer(end)?;
        let bytes = self.buffer.read(begin, end)?;
        self.segments.write(begin, &bytes)?;
        if self.sync {
            self.segments.sync_range(begin, end)?;
        }
        Ok(())
    }

    /// Next offset to be allocated.
    pub fn cur_offset(&self) -> u64 {
        self.state.lock().cur
    }

    /// Offset below which everything is durable.
    pub fn durable_offset(&self) -> u64 {
        self.durable.load(Ordering::Acquire)
    }

    /// Returns true if some allocated bytes are not yet durable.
    pub fn has_unflushed(&self) -> bool {
        self.cur_offset() > self.durable_offset()
    }

    /// Returns true if the log was disabled by a fatal error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Fails with [`LogError::Failed`] once the log is disabled.
    pub fn check_failed(&self) -> LogResult<()> {
        if self.is_failed() {
            Err(LogError::Failed)
        } else {
            Ok(())
        }
    }

    /// The segment table.
    pub fn segments(&self) -> &Arc<SegmentTable> {
        &self.segments
    }

    /// The log buffer.
    pub fn buffer(&self) -> &WindowBuffer {
        &self.buffer
    }
}

impl std::fmt::Debug for LogAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogAllocator")
            .field("cur", &self.cur_offset())
            .field("durable", &self.durable_offset())
            .field("buffer", &self.buffer)
            .field("failed", &self.is_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{block_size, encode_block, LogBlock, RecordSpec, RecordType};
    use bytes::Bytes;
    use sable_common::{Fid, Oid};
    use tempfile::TempDir;

    fn test_allocator(dir: &std::path::Path) -> LogAllocator {
        let config = LogConfig::for_testing(dir);
        let segments = Arc::new(SegmentTable::open(dir, config.segment_size as u64).unwrap());
        let mark = DurableMark::load(dir).unwrap();
        LogAllocator::new(&config, segments, mark, 0, Arc::new(LogStats::new()))
    }

    fn one_record_block(alloc: &Allocation, oid: u32) -> Bytes {
        let spec = RecordSpec::with_payload(
            RecordType::Insert,
            Fid::new(3),
            Oid::new(oid),
            Bytes::from(vec![oid as u8; 32]),
            4,
        );
        encode_block(alloc.lsn, alloc.next_lsn, &[spec]).unwrap()
    }

    fn block_len() -> usize {
        block_size(&[RecordSpec::with_payload(
            RecordType::Insert,
            Fid::new(3),
            Oid::new(1),
            Bytes::from(vec![0u8; 32]),
            4,
        )])
        .unwrap()
    }

    #[test]
    fn test_allocate_sequential() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());

        let a = alloc.allocate(96).unwrap();
        let b = alloc.allocate(48).unwrap();
        assert_eq!(a.lsn, Lsn::make(0, 1));
        assert_eq!(a.next_lsn, b.lsn);
        assert_eq!(b.next_lsn, Lsn::make(144, 1));
        assert_eq!(alloc.cur_offset(), 144);
    }

    #[test]
    fn test_flush_stops_at_outstanding() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());
        let size = block_len();

        let a = alloc.allocate(size).unwrap();
        let b = alloc.allocate(size).unwrap();

        // Only the second block is filled; nothing can become durable.
        alloc.publish(&b, &one_record_block(&b, 2)).unwrap();
        assert_eq!(alloc.flush().unwrap(), 0);

        alloc.publish(&a, &one_record_block(&a, 1)).unwrap();
        assert_eq!(alloc.flush().unwrap(), 2 * size as u64);
        assert!(!alloc.has_unflushed());

        let mut buf = vec![0u8; size];
        alloc.segments().read(b.lsn, &mut buf).unwrap();
        let block = LogBlock::decode(b.lsn, Bytes::from(buf), true).unwrap();
        assert_eq!(block.record(0).unwrap().oid, Oid::new(2));
    }

    #[test]
    fn test_segment_rollover() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());
        let seg = alloc.segments().segment_size();

        let mut last = None;
        let mut rolled = None;
        for _ in 0..((seg as usize / MAX_BLOCK_SIZE) + 2) {
            let a = alloc.allocate(MAX_BLOCK_SIZE - 1024).unwrap();
            alloc.fill_skip(&a).unwrap();
            if a.lsn.segment() == 2 && rolled.is_none() {
                rolled = Some(a);
            }
            last = Some(a);
        }
        let rolled = rolled.expect("allocation moved to the second segment");
        assert_eq!(rolled.lsn.offset(), seg);
        assert!(last.unwrap().next_lsn.offset() > seg);
        assert_eq!(alloc.segments().len(), 2);

        alloc.flush().unwrap();
        assert_eq!(alloc.durable_offset(), alloc.cur_offset());
    }

    #[test]
    fn test_discard_range_becomes_skip() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());

        let a = alloc.allocate(256).unwrap();
        alloc.fill_skip(&a).unwrap();
        alloc.flush().unwrap();

        let mut buf = vec![0u8; 256];
        alloc.segments().read(a.lsn, &mut buf).unwrap();
        let block = LogBlock::decode(a.lsn, Bytes::from(buf), true).unwrap();
        assert_eq!(block.first_type(), RecordType::Skip);
        assert_eq!(block.next_lsn(), a.next_lsn);
    }

    #[test]
    fn test_backpressure_flushes() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());
        let capacity = alloc.buffer().capacity();

        // Write well past the buffer capacity; writers make room by flushing.
        let mut written = 0;
        while written < 3 * capacity {
            let a = alloc.allocate(MAX_BLOCK_SIZE / 2).unwrap();
            alloc.fill_skip(&a).unwrap();
            written += a.size();
        }
        alloc.flush().unwrap();
        assert_eq!(alloc.durable_offset(), alloc.cur_offset());
    }

    #[test]
    fn test_append_raw_requires_contiguity() {
        let dir = TempDir::new().unwrap();
        let alloc = test_allocator(dir.path());

        assert!(matches!(
            alloc.append_raw(64, &[0u8; 16]),
            Err(LogError::NotContiguous { .. })
        ));
        alloc.append_raw(0, &[1u8; 64]).unwrap();
        assert_eq!(alloc.cur_offset(), 64);
        alloc.flush().unwrap();
        assert_eq!(alloc.durable_offset(), 64);
    }
}
