//! Shared fixtures for the end-to-end scenarios.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use partyline::{GlobalLockConfig, JoinableFileManager, NodeId, TransactionalGlm};
use partyline_store::MemoryTxStore;

/// A manager over a private temporary directory.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub manager: Arc<JoinableFileManager>,
}

impl Fixture {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Fixture {
        dir: tempfile::tempdir().unwrap(),
        manager: Arc::new(JoinableFileManager::new()),
    }
}

/// Global lock tunables fast enough for tests.
pub fn fast_global_config() -> GlobalLockConfig {
    GlobalLockConfig {
        ttl: Duration::from_secs(60),
        retry_interval: Duration::from_millis(10),
        default_timeout: Duration::from_millis(500),
    }
}

/// A "cluster node": a global lock manager bound to one shared store.
pub fn node(store: &Arc<MemoryTxStore>, name: &str) -> Arc<TransactionalGlm<MemoryTxStore>> {
    Arc::new(TransactionalGlm::with_config(
        Arc::clone(store),
        NodeId::new(name),
        fast_global_config(),
    ))
}
