//! OID arrays.
//!
//! Each file maps OIDs to slots in a fixed-capacity array. The array is split
//! into chunks that are allocated the first time one of their slots is
//! touched, so a sparse file costs little. Slots are swapped atomically; there
//! is no lock over the array as a whole.

use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;

use sable_common::constants::{OID_CHUNK_BITS, OID_CHUNK_SIZE};
use sable_common::{Oid, TaggedPtr};

use crate::object::Object;

/// What a slot holds.
#[derive(Debug)]
pub enum Head {
    /// The newest version of a record.
    Object(Arc<Object>),
    /// A bare tagged pointer.
    Ptr(TaggedPtr),
    /// A directory of further OIDs.
    Dir(Arc<OidDir>),
}

impl Head {
    /// Short name of the entry kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Ptr(_) => "pointer",
            Self::Dir(_) => "directory",
        }
    }

    /// The version, if the slot holds one.
    pub fn as_object(&self) -> Option<&Arc<Object>> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

/// A growable list of OIDs kept in a slot.
#[derive(Debug, Default)]
pub struct OidDir {
    entries: RwLock<Vec<Oid>>,
}

impl OidDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding `entries`.
    pub fn from_entries(entries: Vec<Oid>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Appends an OID.
    pub fn push(&self, oid: Oid) {
        self.entries.write().push(oid);
    }

    /// Copies out the entries.
    pub fn entries(&self) -> Vec<Oid> {
        self.entries.read().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// An atomically swapped slot.
pub type Slot = ArcSwapOption<Head>;

type Chunk = Box<[Slot]>;

/// Fixed-capacity map from OID to slot.
pub struct OidArray {
    chunks: Box<[OnceLock<Chunk>]>,
    capacity: usize,
}

impl OidArray {
    /// Creates an array of `capacity` slots. No chunk is allocated yet.
    pub fn new(capacity: usize) -> Self {
        let nchunks = capacity.div_ceil(OID_CHUNK_SIZE);
        Self {
            chunks: (0..nchunks).map(|_| OnceLock::new()).collect(),
            capacity,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if `oid` addresses a slot of this array.
    pub fn contains(&self, oid: Oid) -> bool {
        oid.is_valid() && oid.index() < self.capacity
    }

    /// The slot for `oid`, allocating its chunk if needed.
    pub fn slot(&self, oid: Oid) -> Option<&Slot> {
        if !self.contains(oid) {
            return None;
        }
        let (chunk, offset) = split(oid);
        let chunk = self.chunks[chunk].get_or_init(new_chunk);
        Some(&chunk[offset])
    }

    /// The slot's content. Never allocates.
    pub fn get(&self, oid: Oid) -> Option<Arc<Head>> {
        if !self.contains(oid) {
            return None;
        }
        let (chunk, offset) = split(oid);
        self.chunks[chunk].get().and_then(|c| c[offset].load_full())
    }

    /// Every occupied slot, in OID order.
    pub fn entries(&self) -> Vec<(Oid, Arc<Head>)> {
        let mut out = Vec::new();
        for (ci, chunk) in self.chunks.iter().enumerate() {
            let Some(chunk) = chunk.get() else {
                continue;
            };
            for (si, slot) in chunk.iter().enumerate() {
                if let Some(head) = slot.load_full() {
                    let oid = Oid::new(((ci << OID_CHUNK_BITS) | si) as u32);
                    out.push((oid, head));
                }
            }
        }
        out
    }

    /// Highest occupied OID.
    pub fn max_occupied(&self) -> Option<Oid> {
        for (ci, chunk) in self.chunks.iter().enumerate().rev() {
            let Some(chunk) = chunk.get() else {
                continue;
            };
            if let Some(si) = chunk.iter().rposition(|slot| slot.load().is_some()) {
                return Some(Oid::new(((ci << OID_CHUNK_BITS) | si) as u32));
            }
        }
        None
    }

    /// Number of chunks allocated so far.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.get().is_some()).count()
    }
}

impl fmt::Debug for OidArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidArray")
            .field("capacity", &self.capacity)
            .field("allocated_chunks", &self.allocated_chunks())
            .finish()
    }
}

fn split(oid: Oid) -> (usize, usize) {
    let index = oid.index();
    (index >> OID_CHUNK_BITS, index & (OID_CHUNK_SIZE - 1))
}

fn new_chunk() -> Chunk {
    (0..OID_CHUNK_SIZE).map(|_| ArcSwapOption::from(None)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_common::Lsn;

    #[test]
    fn test_chunks_are_lazy() {
        let array = OidArray::new(4 * OID_CHUNK_SIZE);
        assert_eq!(array.allocated_chunks(), 0);
        assert!(array.get(Oid::new(5)).is_none());
        assert_eq!(array.allocated_chunks(), 0);

        let slot = array.slot(Oid::new((2 * OID_CHUNK_SIZE + 3) as u32)).unwrap();
        slot.store(Some(Arc::new(Head::Ptr(TaggedPtr::NULL))));
        assert_eq!(array.allocated_chunks(), 1);
    }

    #[test]
    fn test_bounds() {
        let array = OidArray::new(100);
        assert!(array.slot(Oid::new(99)).is_some());
        assert!(array.slot(Oid::new(100)).is_none());
        assert!(array.slot(Oid::INVALID).is_none());
    }

    #[test]
    fn test_entries_and_max() {
        let array = OidArray::new(3 * OID_CHUNK_SIZE);
        assert_eq!(array.max_occupied(), None);

        let far = Oid::new((OID_CHUNK_SIZE + 10) as u32);
        for oid in [Oid::new(1), Oid::new(7), far] {
            let obj = Object::tombstone(Lsn::make(64, 1));
            array.slot(oid).unwrap().store(Some(Arc::new(Head::Object(Arc::new(obj)))));
        }

        let oids: Vec<_> = array.entries().into_iter().map(|(oid, _)| oid).collect();
        assert_eq!(oids, vec![Oid::new(1), Oid::new(7), far]);
        assert_eq!(array.max_occupied(), Some(far));
    }

    #[test]
    fn test_dir() {
        let dir = OidDir::new();
        assert!(dir.is_empty());
        dir.push(Oid::new(4));
        dir.push(Oid::new(9));
        assert_eq!(dir.entries(), vec![Oid::new(4), Oid::new(9)]);
        assert_eq!(dir.len(), 2);

        let head = Head::Dir(Arc::new(dir));
        assert_eq!(head.kind_name(), "directory");
        assert!(head.as_object().is_none());
    }
}
