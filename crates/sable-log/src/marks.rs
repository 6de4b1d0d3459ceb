//! Durable-mark and checkpoint-marker files.
//!
//! Both are empty files whose names carry the LSNs. The durable mark is
//! renamed forward as the log becomes durable; a checkpoint marker is written
//! only after its data file has been synced.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use sable_common::Lsn;

use crate::error::LogResult;

fn parse_hex_lsn(s: &str) -> Option<Lsn> {
    u64::from_str_radix(s, 16).ok().map(Lsn::from_u64)
}

/// The persisted last-known-durable LSN.
pub struct DurableMark {
    dir: PathBuf,
    current: Mutex<Option<Lsn>>,
}

impl DurableMark {
    /// File name for a durable mark.
    pub fn file_name(lsn: Lsn) -> String {
        format!("dur-{:016x}", lsn.as_u64())
    }

    /// Parses a durable mark file name.
    pub fn parse_file_name(name: &str) -> Option<Lsn> {
        name.strip_prefix("dur-").and_then(parse_hex_lsn)
    }

    /// Finds the newest durable mark in `dir`, removing stale ones.
    pub fn load(dir: impl AsRef<Path>) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut marks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(lsn) = entry.file_name().to_str().and_then(Self::parse_file_name) {
                marks.push(lsn);
            }
        }
        marks.sort_by_key(|lsn| lsn.offset());

        let current = marks.pop();
        for stale in marks {
            warn!(lsn = ?stale, "removing stale durable mark");
            fs::remove_file(dir.join(Self::file_name(stale)))?;
        }

        Ok(Self {
            dir,
            current: Mutex::new(current),
        })
    }

    /// Returns the recorded durable LSN, if any.
    pub fn get(&self) -> Option<Lsn> {
        *self.current.lock()
    }

    /// Moves the mark to `lsn`.
    pub fn update(&self, lsn: Lsn) -> LogResult<()> {
        let mut current = self.current.lock();
        if *current == Some(lsn) {
            return Ok(());
        }

        let new_path = self.dir.join(Self::file_name(lsn));
        match *current {
            Some(old) => fs::rename(self.dir.join(Self::file_name(old)), &new_path)?,
            None => {
                File::create(&new_path)?;
            }
        }
        *current = Some(lsn);
        Ok(())
    }
}

impl std::fmt::Debug for DurableMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableMark")
            .field("dir", &self.dir)
            .field("current", &self.get())
            .finish()
    }
}

/// A completed checkpoint: its data file covers the state as of `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    /// LSN the checkpoint captured; replay resumes here.
    pub start: Lsn,
    /// Log position when the checkpoint finished.
    pub end: Lsn,
}

impl CheckpointMark {
    /// Marker file name: `chk-<start>-<end>`.
    pub fn file_name(&self) -> String {
        format!("chk-{:016x}-{:016x}", self.start.as_u64(), self.end.as_u64())
    }

    /// Data file name: `chd-<start>`.
    pub fn data_file_name(start: Lsn) -> String {
        format!("chd-{:016x}", start.as_u64())
    }

    /// Parses a marker file name.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let (start, end) = name.strip_prefix("chk-")?.split_once('-')?;
        Some(Self {
            start: parse_hex_lsn(start)?,
            end: parse_hex_lsn(end)?,
        })
    }

    /// Returns the newest checkpoint in `dir` whose start is at or before `limit`.
    pub fn find_newest(dir: impl AsRef<Path>, limit: Lsn) -> LogResult<Option<Self>> {
        let dir = dir.as_ref();
        let mut newest: Option<Self> = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(mark) = entry.file_name().to_str().and_then(Self::parse_file_name) else {
                continue;
            };
            if mark.start.offset() > limit.offset() {
                warn!(start = ?mark.start, "ignoring checkpoint past the durable log end");
                continue;
            }
            if !dir.join(Self::data_file_name(mark.start)).exists() {
                warn!(start = ?mark.start, "ignoring checkpoint marker without data file");
                continue;
            }
            if newest.map_or(true, |n| n.start.offset() < mark.start.offset()) {
                newest = Some(mark);
            }
        }
        Ok(newest)
    }

    /// Writes the marker, then removes older markers and data files.
    pub fn persist(&self, dir: impl AsRef<Path>) -> LogResult<()> {
        let dir = dir.as_ref();
        File::create(dir.join(self.file_name()))?.sync_all()?;

        let keep_data = Self::data_file_name(self.start);
        let keep_mark = self.file_name();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let stale = (name.starts_with("chk-") && name != keep_mark)
                || (name.starts_with("chd-") && name != keep_data);
            if stale {
                debug!(file = name, "removing superseded checkpoint file");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_durable_mark_update() {
        let dir = TempDir::new().unwrap();
        let mark = DurableMark::load(dir.path()).unwrap();
        assert_eq!(mark.get(), None);

        mark.update(Lsn::make(96, 1)).unwrap();
        mark.update(Lsn::make(192, 1)).unwrap();
        assert_eq!(mark.get(), Some(Lsn::make(192, 1)));

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![DurableMark::file_name(Lsn::make(192, 1))]);

        let reloaded = DurableMark::load(dir.path()).unwrap();
        assert_eq!(reloaded.get(), Some(Lsn::make(192, 1)));
    }

    #[test]
    fn test_durable_mark_keeps_newest() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join(DurableMark::file_name(Lsn::make(48, 1)))).unwrap();
        File::create(dir.path().join(DurableMark::file_name(Lsn::make(480, 1)))).unwrap();

        let mark = DurableMark::load(dir.path()).unwrap();
        assert_eq!(mark.get(), Some(Lsn::make(480, 1)));
        assert!(!dir
            .path()
            .join(DurableMark::file_name(Lsn::make(48, 1)))
            .exists());
    }

    #[test]
    fn test_checkpoint_mark_names() {
        let mark = CheckpointMark {
            start: Lsn::make(0x100, 1),
            end: Lsn::make(0x200, 1),
        };
        assert_eq!(CheckpointMark::parse_file_name(&mark.file_name()), Some(mark));
        assert!(CheckpointMark::data_file_name(mark.start).starts_with("chd-"));
        assert_eq!(CheckpointMark::parse_file_name("chk-zz-01"), None);
    }

    #[test]
    fn test_find_newest_checkpoint() {
        let dir = TempDir::new().unwrap();
        let old = CheckpointMark {
            start: Lsn::make(0x100, 1),
            end: Lsn::make(0x180, 1),
        };
        let new = CheckpointMark {
            start: Lsn::make(0x400, 1),
            end: Lsn::make(0x480, 1),
        };

        File::create(dir.path().join(CheckpointMark::data_file_name(old.start))).unwrap();
        File::create(dir.path().join(old.file_name())).unwrap();
        // Marker without data is ignored.
        File::create(dir.path().join(new.file_name())).unwrap();

        let found = CheckpointMark::find_newest(dir.path(), Lsn::make(0x1000, 1)).unwrap();
        assert_eq!(found, Some(old));

        File::create(dir.path().join(CheckpointMark::data_file_name(new.start))).unwrap();
        let found = CheckpointMark::find_newest(dir.path(), Lsn::make(0x1000, 1)).unwrap();
        assert_eq!(found, Some(new));

        // Checkpoints past the durable end are not usable.
        let found = CheckpointMark::find_newest(dir.path(), Lsn::make(0x200, 1)).unwrap();
        assert_eq!(found, Some(old));
    }

    #[test]
    fn test_persist_removes_older_checkpoints() {
        let dir = TempDir::new().unwrap();
        let old = CheckpointMark {
            start: Lsn::make(0x100, 1),
            end: Lsn::make(0x180, 1),
        };
        File::create(dir.path().join(CheckpointMark::data_file_name(old.start))).unwrap();
        old.persist(dir.path()).unwrap();

        let new = CheckpointMark {
            start: Lsn::make(0x400, 1),
            end: Lsn::make(0x480, 1),
        };
        File::create(dir.path().join(CheckpointMark::data_file_name(new.start))).unwrap();
        new.persist(dir.path()).unwrap();

        assert!(!dir.path().join(old.file_name()).exists());
        assert!(!dir
            .path()
            .join(CheckpointMark::data_file_name(old.start))
            .exists());
        assert!(dir.path().join(new.file_name()).exists());
    }
}
