//! Circular in-memory log buffer.
//!
//! The buffer is a window over the logical log. Byte `offset` of the log lives
//! at `offset % capacity`. Two cursors bound the window: `read_begin` (bytes
//! before it are durable and released) and `write_end` (bytes before it are
//! published for reading). Writers may fill any range inside
//! `[read_begin, read_begin + capacity)`.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{LogError, LogResult};

/// Fixed-capacity circular window over the logical log.
pub struct WindowBuffer {
    data: Mutex<Box<[u8]>>,
    capacity: u64,
    read_begin: AtomicU64,
    write_end: AtomicU64,
}

impl WindowBuffer {
    /// Creates a buffer whose window starts at log offset `start`.
    pub fn new(capacity: usize, start: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            capacity: capacity as u64,
            read_begin: AtomicU64::new(start),
            write_end: AtomicU64::new(start),
        }
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// First offset still held by the buffer.
    pub fn read_begin(&self) -> u64 {
        self.read_begin.load(Ordering::Acquire)
    }

    /// One past the last offset published for reading.
    pub fn write_end(&self) -> u64 {
        self.write_end.load(Ordering::Acquire)
    }

    /// Published bytes not yet released.
    pub fn unread(&self) -> u64 {
        self.write_end() - self.read_begin()
    }

    /// Returns true if a range ending at `end` fits in the window right now.
    pub fn has_room(&self, end: u64) -> bool {
        end <= self.read_begin() + self.capacity
    }

    /// Copies `bytes` into the window at log offset `offset`.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> LogResult<()> {
        let end = offset + bytes.len() as u64;
        if offset < self.read_begin() || !self.has_room(end) {
            return Err(LogError::invariant(format!(
                "buffer write [{offset:#x}, {end:#x}) outside window starting at {:#x}",
                self.read_begin()
            )));
        }

        let pos = (offset % self.capacity) as usize;
        let first = bytes.len().min(self.capacity() - pos);
        let mut data = self.data.lock();
        data[pos..pos + first].copy_from_slice(&bytes[..first]);
        data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        Ok(())
    }

    /// Publishes every byte before `end` for reading.
    ///
    /// Fails if `end` would overrun unreleased bytes; callers must wait for the
    /// reader to advance first.
    pub fn advance_writer(&self, end: u64) -> LogResult<()> {
        if !self.has_room(end) {
            return Err(LogError::invariant(format!(
                "writer cursor {end:#x} would overrun reader at {:#x}",
                self.read_begin()
            )));
        }
        self.write_end.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Copies published bytes `[begin, end)` out of the window.
    pub fn read(&self, begin: u64, end: u64) -> LogResult<Vec<u8>> {
        if begin < self.read_begin() || end > self.write_end() || begin > end {
            return Err(LogError::invariant(format!(
                "buffer read [{begin:#x}, {end:#x}) outside published range [{:#x}, {:#x})",
                self.read_begin(),
                self.write_end()
            )));
        }

        let len = (end - begin) as usize;
        let pos = (begin % self.capacity) as usize;
        let first = len.min(self.capacity() - pos);
        let mut out = Vec::with_capacity(len);
        let data = self.data.lock();
        out.extend_from_slice(&data[pos..pos + first]);
        out.extend_from_slice(&data[..len - first]);
        Ok(out)
    }

    /// Releases every byte before `begin`; they must already be published.
    pub fn advance_reader(&self, begin: u64) -> LogResult<()> {
        if begin > self.write_end() {
            return Err(LogError::invariant(format!(
                "reader cursor {begin:#x} passes writer at {:#x}",
                self.write_end()
            )));
        }
        self.read_begin.fetch_max(begin, Ordering::AcqRel);
        Ok(())
    }
}

impl std::fmt::Debug for WindowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBuffer")
            .field("capacity", &self.capacity)
            .field("read_begin", &self.read_begin())
            .field("write_end", &self.write_end())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_publish_read() {
        let buf = WindowBuffer::new(64, 0);
        buf.write_at(0, b"abcdefgh").unwrap();
        buf.advance_writer(8).unwrap();

        assert_eq!(buf.unread(), 8);
        assert_eq!(buf.read(2, 6).unwrap(), b"cdef");

        buf.advance_reader(8).unwrap();
        assert_eq!(buf.unread(), 0);
    }

    #[test]
    fn test_wrap_around() {
        let buf = WindowBuffer::new(16, 10);
        buf.write_at(10, b"0123456789").unwrap();
        buf.advance_writer(20).unwrap();
        assert_eq!(buf.read(10, 20).unwrap(), b"0123456789");
    }

    #[test]
    fn test_backpressure() {
        let buf = WindowBuffer::new(16, 0);
        assert!(buf.has_room(16));
        assert!(!buf.has_room(17));
        assert!(buf.write_at(8, &[0u8; 16]).is_err());
        assert!(buf.advance_writer(17).is_err());

        buf.write_at(0, &[1u8; 16]).unwrap();
        buf.advance_writer(16).unwrap();
        buf.advance_reader(8).unwrap();

        // Released space is reusable.
        assert!(buf.has_room(24));
        buf.write_at(16, &[2u8; 8]).unwrap();
        buf.advance_writer(24).unwrap();
        assert_eq!(buf.read(12, 20).unwrap(), vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_cursor_misuse() {
        let buf = WindowBuffer::new(16, 0);
        assert!(buf.advance_reader(4).is_err());
        assert!(buf.read(0, 4).is_err());

        buf.write_at(0, &[0u8; 4]).unwrap();
        buf.advance_writer(4).unwrap();
        buf.advance_reader(4).unwrap();
        assert!(buf.write_at(0, &[0u8; 2]).is_err());
    }
}
