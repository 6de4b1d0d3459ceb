//! Workload generators.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sable_common::{Fid, Oid};
use sable_oid::{Engine, OidError, OidResult};

/// Deterministic payload generator.
pub struct PayloadGen {
    rng: StdRng,
}

impl PayloadGen {
    /// Creates a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A payload of exactly `len` random bytes.
    pub fn exact(&mut self, len: usize) -> Bytes {
        let data: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
        Bytes::from(data)
    }

    /// A payload whose length is drawn from `min..=max`.
    pub fn between(&mut self, min: usize, max: usize) -> Bytes {
        let len = self.rng.gen_range(min..=max);
        self.exact(len)
    }

    /// A random index below `n`.
    pub fn pick(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }
}

/// Encodes a counter value as a record payload.
pub fn counter_payload(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decodes a payload written by [`counter_payload`].
pub fn counter_value(payload: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&payload[..8]);
    u64::from_be_bytes(word)
}

/// Adds one to the counter at `oid`, retrying on write conflicts.
///
/// Returns how many attempts lost to a conflict.
pub fn increment(engine: &Engine, fid: Fid, oid: Oid) -> OidResult<usize> {
    let mut conflicts = 0;
    loop {
        let mut txn = engine.begin()?;
        let current = txn
            .read(fid, oid)?
            .map(|p| counter_value(&p))
            .ok_or(OidError::NotFound { fid, oid })?;
        match txn.update(fid, oid, counter_payload(current + 1)) {
            Ok(()) => {
                txn.commit()?;
                return Ok(conflicts);
            }
            Err(e) if e.is_conflict() => {
                txn.abort()?;
                conflicts += 1;
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}
