//! The OID manager.
//!
//! Every file (table or index) owns an [`OidArray`] and, optionally, an
//! allocator. File names live in the metadata file: the slot whose OID equals
//! a file's id holds that file's name.
//!
//! Version chains hang off object slots, newest first. Installing a version
//! is a compare-and-swap on the slot, so writers never block readers and a
//! lost race simply retries against the new head.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, trace};

use sable_common::constants::{FIRST_OID, FIRST_USER_FID, METADATA_FID};
use sable_common::{Fid, Lsn, Oid};

use crate::alloc::OidAllocator;
use crate::array::{Head, OidArray, OidDir, Slot};
use crate::error::{OidError, OidResult};
use crate::object::{Object, Stamp};
use crate::snapshot::Snapshot;

/// One file's OID array and allocator.
pub struct OidFile {
    fid: Fid,
    array: OidArray,
    needs_alloc: bool,
    alloc: ArcSwapOption<OidAllocator>,
}

impl OidFile {
    fn new(fid: Fid, capacity: usize, needs_alloc: bool) -> Self {
        let alloc = needs_alloc.then(|| Arc::new(OidAllocator::new(fid, capacity)));
        Self {
            fid,
            array: OidArray::new(capacity),
            needs_alloc,
            alloc: ArcSwapOption::new(alloc),
        }
    }

    /// File id.
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// The OID array.
    pub fn array(&self) -> &OidArray {
        &self.array
    }

    /// Returns true if the file hands out OIDs.
    pub fn has_allocator(&self) -> bool {
        self.needs_alloc
    }

    /// The file's allocator.
    pub fn allocator(&self) -> OidResult<Arc<OidAllocator>> {
        self.alloc.load_full().ok_or(OidError::NoAllocator(self.fid))
    }

    fn slot(&self, oid: Oid) -> OidResult<&Slot> {
        self.array.slot(oid).ok_or(OidError::OidOutOfRange { fid: self.fid, oid })
    }

    fn check(&self, oid: Oid) -> OidResult<()> {
        if self.array.contains(oid) {
            Ok(())
        } else {
            Err(OidError::OidOutOfRange { fid: self.fid, oid })
        }
    }
}

impl fmt::Debug for OidFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidFile")
            .field("fid", &self.fid)
            .field("array", &self.array)
            .field("needs_alloc", &self.needs_alloc)
            .finish()
    }
}

/// Maps (file, OID) to slots and manages version chains.
pub struct OidManager {
    files: DashMap<Fid, Arc<OidFile>>,
    next_fid: AtomicU32,
    capacity: usize,
}

impl OidManager {
    /// Creates a manager whose arrays hold `capacity` slots each.
    pub fn new(capacity: usize) -> Self {
        let files = DashMap::new();
        let meta = Fid::new(METADATA_FID);
        files.insert(meta, Arc::new(OidFile::new(meta, capacity, false)));
        Self {
            files,
            next_fid: AtomicU32::new(FIRST_USER_FID),
            capacity,
        }
    }

    /// Capacity of each array.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ---- files ----

    /// Creates a file with a fresh id.
    pub fn create_file(&self, needs_alloc: bool) -> OidResult<Fid> {
        let fid = Fid::new(self.next_fid.fetch_add(1, Ordering::AcqRel));
        if !self.fid_fits_metadata(fid) {
            return Err(OidError::FileFull(Fid::new(METADATA_FID)));
        }
        let file = Arc::new(OidFile::new(fid, self.capacity, needs_alloc));
        self.files.insert(fid, file);
        debug!(?fid, needs_alloc, "created file");
        Ok(fid)
    }

    /// Creates a file with a known id, or returns it if it already exists.
    pub fn recreate_file(&self, fid: Fid, needs_alloc: bool) -> OidResult<Arc<OidFile>> {
        if !fid.is_valid() || !self.fid_fits_metadata(fid) {
            return Err(OidError::FileNotFound(fid));
        }
        let file = self
            .files
            .entry(fid)
            .or_insert_with(|| Arc::new(OidFile::new(fid, self.capacity, needs_alloc)))
            .clone();
        self.next_fid.fetch_max(fid.as_u32() + 1, Ordering::AcqRel);
        Ok(file)
    }

    /// Removes a file and its name.
    pub fn destroy_file(&self, fid: Fid) -> OidResult<()> {
        if fid == Fid::new(METADATA_FID) {
            return Err(OidError::invariant("the metadata file cannot be destroyed"));
        }
        self.files.remove(&fid).ok_or(OidError::FileNotFound(fid))?;
        let meta = self.file(Fid::new(METADATA_FID))?;
        meta.slot(Oid::new(fid.as_u32()))?.store(None);
        debug!(?fid, "destroyed file");
        Ok(())
    }

    /// Returns true if the file exists.
    pub fn file_exists(&self, fid: Fid) -> bool {
        self.files.contains_key(&fid)
    }

    /// Looks up a file.
    pub fn file(&self, fid: Fid) -> OidResult<Arc<OidFile>> {
        self.files
            .get(&fid)
            .map(|f| Arc::clone(f.value()))
            .ok_or(OidError::FileNotFound(fid))
    }

    /// Every file id, metadata included, in ascending order.
    pub fn file_ids(&self) -> Vec<Fid> {
        let mut fids: Vec<_> = self.files.iter().map(|f| *f.key()).collect();
        fids.sort();
        fids
    }

    /// Records a file's name in the metadata file.
    pub fn set_file_name(&self, fid: Fid, name: &str, clsn: Lsn) -> OidResult<()> {
        let meta = self.file(Fid::new(METADATA_FID))?;
        let obj = Object::committed(Bytes::copy_from_slice(name.as_bytes()), clsn, 0);
        meta.slot(Oid::new(fid.as_u32()))?
            .store(Some(Arc::new(Head::Object(Arc::new(obj)))));
        Ok(())
    }

    /// A file's name, if one was recorded.
    pub fn file_name(&self, fid: Fid) -> Option<String> {
        let meta = self.file(Fid::new(METADATA_FID)).ok()?;
        let head = meta.array.get(Oid::new(fid.as_u32()))?;
        let payload = head.as_object()?.payload()?;
        String::from_utf8(payload.to_vec()).ok()
    }

    /// Finds a file by name.
    pub fn find_file(&self, name: &str) -> Option<Fid> {
        self.file_ids()
            .into_iter()
            .find(|&fid| self.file_name(fid).as_deref() == Some(name))
    }

    fn fid_fits_metadata(&self, fid: Fid) -> bool {
        (fid.as_u32() as usize) < self.capacity
    }

    // ---- allocation ----

    /// Rebuilds a file's allocator from the occupied slots.
    ///
    /// The high-water mark lands past the highest occupied OID and every empty
    /// slot below it goes on the free list.
    pub fn recreate_allocator(&self, fid: Fid) -> OidResult<()> {
        let file = self.file(fid)?;
        if !file.needs_alloc {
            return Err(OidError::NoAllocator(fid));
        }
        let hwm = file
            .array
            .max_occupied()
            .map_or(FIRST_OID, |oid| oid.as_u32() + 1);
        let alloc = OidAllocator::with_hwm(fid, self.capacity, Oid::new(hwm));
        for raw in FIRST_OID..hwm {
            let oid = Oid::new(raw);
            if file.array.get(oid).is_none() {
                alloc.free(oid);
            }
        }
        trace!(?fid, hwm, free = alloc.free_count(), "recreated allocator");
        file.alloc.store(Some(Arc::new(alloc)));
        Ok(())
    }

    /// Rebuilds the allocator of every file that has one.
    pub fn recreate_allocators(&self) -> OidResult<()> {
        for fid in self.file_ids() {
            if self.file(fid)?.needs_alloc {
                self.recreate_allocator(fid)?;
            }
        }
        Ok(())
    }

    /// Allocates an OID in `fid`.
    pub fn alloc_oid(&self, fid: Fid) -> OidResult<Oid> {
        self.file(fid)?.allocator()?.alloc()
    }

    /// Empties a slot and returns its OID to the allocator.
    pub fn free_oid(&self, fid: Fid, oid: Oid) -> OidResult<Option<Arc<Head>>> {
        let file = self.file(fid)?;
        let old = file.slot(oid)?.swap(None);
        if let Ok(alloc) = file.allocator() {
            alloc.free(oid);
        }
        Ok(old)
    }

    // ---- slots ----

    /// The slot's content.
    pub fn oid_get(&self, fid: Fid, oid: Oid) -> OidResult<Option<Arc<Head>>> {
        let file = self.file(fid)?;
        file.check(oid)?;
        Ok(file.array.get(oid))
    }

    /// Overwrites a slot, returning what it held.
    pub fn oid_put(&self, fid: Fid, oid: Oid, head: Head) -> OidResult<Option<Arc<Head>>> {
        Ok(self.file(fid)?.slot(oid)?.swap(Some(Arc::new(head))))
    }

    /// Fills an empty slot.
    pub fn oid_put_new(&self, fid: Fid, oid: Oid, head: Head) -> OidResult<()> {
        if self.oid_put_new_if_absent(fid, oid, head)? {
            Ok(())
        } else {
            Err(OidError::SlotOccupied { fid, oid })
        }
    }

    /// Fills a slot if it is empty. Returns whether it did.
    pub fn oid_put_new_if_absent(&self, fid: Fid, oid: Oid, head: Head) -> OidResult<bool> {
        let file = self.file(fid)?;
        let slot = file.slot(oid)?;
        let prev = slot.compare_and_swap(&None::<Arc<Head>>, Some(Arc::new(head)));
        Ok(prev.is_none())
    }

    /// Puts an empty directory into an empty slot.
    pub fn oid_put_dir(&self, fid: Fid, oid: Oid) -> OidResult<Arc<OidDir>> {
        let dir = Arc::new(OidDir::new());
        self.oid_put_new(fid, oid, Head::Dir(Arc::clone(&dir)))?;
        Ok(dir)
    }

    /// Appends `entry` to the directory at `oid`.
    pub fn oid_dir_push(&self, fid: Fid, oid: Oid, entry: Oid) -> OidResult<()> {
        self.dir(fid, oid)?.push(entry);
        Ok(())
    }

    /// The entries of the directory at `oid`.
    pub fn oid_get_dir(&self, fid: Fid, oid: Oid) -> OidResult<Vec<Oid>> {
        Ok(self.dir(fid, oid)?.entries())
    }

    fn dir(&self, fid: Fid, oid: Oid) -> OidResult<Arc<OidDir>> {
        let head = self.oid_get(fid, oid)?.ok_or(OidError::NotFound { fid, oid })?;
        match head.as_ref() {
            Head::Dir(dir) => Ok(Arc::clone(dir)),
            other => Err(OidError::WrongEntry {
                fid,
                oid,
                expected: "directory",
                found: other.kind_name(),
            }),
        }
    }

    // ---- versions ----

    /// The newest version in a slot.
    pub fn latest_object(&self, fid: Fid, oid: Oid) -> OidResult<Option<Arc<Object>>> {
        match self.oid_get(fid, oid)? {
            None => Ok(None),
            Some(head) => match head.as_ref() {
                Head::Object(obj) => Ok(Some(Arc::clone(obj))),
                other => Err(OidError::WrongEntry {
                    fid,
                    oid,
                    expected: "object",
                    found: other.kind_name(),
                }),
            },
        }
    }

    /// The version `snapshot` sees, which may be a tombstone.
    pub fn get_version(&self, fid: Fid, oid: Oid, snapshot: &Snapshot) -> OidResult<Option<Arc<Object>>> {
        Ok(self
            .latest_object(fid, oid)?
            .and_then(|head| snapshot.visible_version(head)))
    }

    /// Puts the first version of a new record into an empty slot.
    pub fn install_new(&self, fid: Fid, oid: Oid, obj: Arc<Object>) -> OidResult<()> {
        self.oid_put_new(fid, oid, Head::Object(obj))
    }

    /// Installs `obj` as the newest version, first-updater-wins.
    ///
    /// Fails with `Conflict` if the head was written by another in-flight
    /// transaction or committed after the snapshot. A head the snapshot's own
    /// transaction wrote is replaced rather than stacked on; it is returned.
    pub fn install_version(
        &self,
        fid: Fid,
        oid: Oid,
        obj: Arc<Object>,
        snapshot: &Snapshot,
    ) -> OidResult<Option<Arc<Object>>> {
        let file = self.file(fid)?;
        let slot = file.slot(oid)?;
        loop {
            let current = slot.load_full();
            let head = match current.as_deref() {
                None => return Err(OidError::NotFound { fid, oid }),
                Some(Head::Object(head)) => Arc::clone(head),
                Some(other) => {
                    return Err(OidError::WrongEntry {
                        fid,
                        oid,
                        expected: "object",
                        found: other.kind_name(),
                    })
                }
            };

            let (next, replaced) = match head.wait_stamp() {
                Stamp::InFlight if snapshot.owns(&head) => (head.next(), Some(Arc::clone(&head))),
                Stamp::Committed(clsn) if snapshot.sees_commit(clsn) => (Some(Arc::clone(&head)), None),
                _ => return Err(OidError::Conflict { fid, oid }),
            };
            if head.is_deleted() {
                return Err(OidError::NotFound { fid, oid });
            }

            obj.set_next(next);
            let new = Some(Arc::new(Head::Object(Arc::clone(&obj))));
            if cas_slot(slot, &current, new) {
                return Ok(replaced);
            }
            trace!(?fid, ?oid, "install lost a race, retrying");
        }
    }

    /// Removes `obj` from the head of its chain.
    ///
    /// The slot is emptied if `obj` was the only version.
    pub fn unlink_version(&self, fid: Fid, oid: Oid, obj: &Arc<Object>) -> OidResult<()> {
        let file = self.file(fid)?;
        let slot = file.slot(oid)?;
        loop {
            let current = slot.load_full();
            match current.as_deref() {
                Some(Head::Object(head)) if Arc::ptr_eq(head, obj) => {}
                _ => return Err(OidError::invariant(format!("{oid:?} in {fid:?}: version to unlink is not the head"))),
            }
            let next = obj.next().map(|n| Arc::new(Head::Object(n)));
            if cas_slot(slot, &current, next) {
                return Ok(());
            }
        }
    }

    /// Installs a recovered version.
    ///
    /// The slot keeps whichever of the two versions committed later, so
    /// replaying the same range twice changes nothing. Returns whether `obj`
    /// was installed.
    pub fn replay_version(&self, fid: Fid, oid: Oid, obj: Object) -> OidResult<bool> {
        let file = self.file(fid)?;
        let slot = file.slot(oid)?;
        let stamp = obj.clsn().map_or(0, Lsn::offset);
        let new = Some(Arc::new(Head::Object(Arc::new(obj))));
        loop {
            let current = slot.load_full();
            if let Some(Head::Object(head)) = current.as_deref() {
                if head.clsn().is_some_and(|clsn| clsn.offset() > stamp) {
                    return Ok(false);
                }
            }
            if cas_slot(slot, &current, new.clone()) {
                return Ok(true);
            }
        }
    }

    /// Cuts off every version no snapshot at or after `oldest` can see.
    ///
    /// In each chain, everything older than the newest version committed at
    /// or before `oldest` is unlinked. The detached tails are returned for
    /// deferred release.
    pub fn prune(&self, oldest: Lsn) -> Vec<Arc<Object>> {
        let horizon = Snapshot::at(oldest);
        let mut tails = Vec::new();
        for file in self.files.iter() {
            for (_, head) in file.array.entries() {
                let Head::Object(obj) = head.as_ref() else {
                    continue;
                };
                let mut cur = Some(Arc::clone(obj));
                while let Some(version) = cur {
                    if matches!(version.wait_stamp(), Stamp::Committed(clsn) if horizon.sees_commit(clsn)) {
                        if let Some(tail) = version.take_next() {
                            tails.push(tail);
                        }
                        break;
                    }
                    cur = version.next();
                }
            }
        }
        tails
    }

    /// Number of object slots in `fid`.
    pub fn object_count(&self, fid: Fid) -> OidResult<usize> {
        Ok(self
            .file(fid)?
            .array
            .entries()
            .iter()
            .filter(|(_, head)| head.as_object().is_some())
            .count())
    }
}

impl fmt::Debug for OidManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidManager")
            .field("files", &self.files.len())
            .field("next_fid", &self.next_fid.load(Ordering::Relaxed))
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn cas_slot(slot: &Slot, current: &Option<Arc<Head>>, new: Option<Arc<Head>>) -> bool {
    let prev = slot.compare_and_swap(current, new);
    match (&*prev, current) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
