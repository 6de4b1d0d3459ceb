//! Test utilities and helpers.

use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use sable_common::constants::MIN_LOG_SEGMENT_SIZE;
use sable_common::{Fid, Lsn, Oid};
use sable_log::segment::Segment;
use sable_oid::{Engine, EngineConfig, Head, OidManager, OidResult};

static TRACING: Once = Once::new();

/// Installs a test-friendly subscriber once per process.
///
/// Output is controlled by `RUST_LOG`; nothing is printed by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A database directory that outlives the engines opened on it.
pub struct TestDb {
    dir: TempDir,
    config: EngineConfig,
}

impl TestDb {
    /// A fresh directory with the test configuration.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// A fresh directory with an adjusted test configuration.
    pub fn with_config(adjust: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("create temp dir");
        let config = adjust(EngineConfig::for_testing(dir.path()));
        Self { dir, config }
    }

    /// Directory holding the log and checkpoints.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The configuration engines are opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens (or reopens) the engine, running recovery.
    pub fn open(&self) -> Engine {
        self.try_open().expect("open engine")
    }

    /// Opens the engine, returning the error if recovery fails.
    pub fn try_open(&self) -> OidResult<Engine> {
        Engine::open(self.config.clone())
    }

    /// Path of the first log segment.
    pub fn first_segment_path(&self) -> PathBuf {
        self.path().join(Segment::file_name(1, 0, MIN_LOG_SEGMENT_SIZE as u64))
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulates a crash: stops the engine without flushing and returns the
/// durable LSN at the moment it stopped.
pub fn crash(engine: Engine) -> Lsn {
    engine.halt();
    let durable = engine.log().durable_flushed_lsn().expect("durable lsn");
    tracing::debug!(?durable, "simulated crash");
    drop(engine);
    durable
}

/// What recovery put into one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    /// File.
    pub fid: Fid,
    /// Slot.
    pub oid: Oid,
    /// Commit LSN of each version, newest first; `None` for uncommitted versions.
    pub versions: Vec<Option<Lsn>>,
    /// Stored location of the newest version.
    pub pdest: u64,
    /// Whether the newest version is a tombstone.
    pub deleted: bool,
}

/// Every occupied object slot of `oids`, in (file, OID) order.
pub fn slot_states(oids: &OidManager) -> Vec<SlotState> {
    let mut states = Vec::new();
    for fid in oids.file_ids() {
        let file = oids.file(fid).expect("listed file exists");
        for (oid, head) in file.array().entries() {
            let Head::Object(obj) = head.as_ref() else {
                continue;
            };
            let mut versions = Vec::new();
            let mut cur = Some(obj.clone());
            while let Some(version) = cur {
                versions.push(version.clsn());
                cur = version.next();
            }
            states.push(SlotState {
                fid,
                oid,
                versions,
                pdest: obj.pdest().as_u64(),
                deleted: obj.is_deleted(),
            });
        }
    }
    states
}
