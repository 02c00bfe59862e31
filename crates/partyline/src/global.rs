//! Cluster-wide lock manager over a transactional key-value store.
//!
//! Exclusive transitions (write, delete) consult this layer before the
//! local registry, so only one node in the cluster produces or deletes a
//! path at a time while reads stay shared. Every written record carries a
//! coarse TTL so a dead node cannot pin a path indefinitely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use partyline_store::{StoreError, TxKvStore};
use serde::{Deserialize, Serialize};

use crate::file_tree::CancelToken;
use crate::types::{Deadline, LockLevel, NodeId, PartylineError, PartylineResult};

/// Stored record for one globally locked path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalLockOwner {
    /// Level held across the cluster.
    pub level: LockLevel,
    /// Nodes holding the lock. More than one only when `level` is Read.
    pub owners: Vec<NodeId>,
}

impl GlobalLockOwner {
    /// A record with `node` as the sole owner.
    pub fn new(level: LockLevel, node: NodeId) -> Self {
        GlobalLockOwner {
            level,
            owners: vec![node],
        }
    }

    /// True if `node` is among the owners.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.owners.contains(node)
    }

    /// Adds `node` unless already present.
    pub fn add(&mut self, node: NodeId) {
        if !self.contains(&node) {
            self.owners.push(node);
        }
    }

    /// Removes `node` if present.
    pub fn remove(&mut self, node: &NodeId) {
        self.owners.retain(|owner| owner != node);
    }

    /// True once no owners remain.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Cluster-wide exclusion keyed by path.
///
/// Implementations apply the same admit rules as the local registry over
/// the distributed key space: reads share, writes and deletes exclude.
pub trait GlobalLockManager: Send + Sync {
    /// Tries to take `level` on `path`, waiting up to `timeout`.
    ///
    /// Returns false when the deadline passes without admission. A zero
    /// timeout selects the implementation's default. A supplied
    /// cancellation token aborts the wait with
    /// [`PartylineError::Cancelled`].
    fn try_lock(
        &self,
        path: &str,
        level: LockLevel,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<bool>;

    /// Releases `level` on `path`.
    fn unlock(&self, path: &str, level: LockLevel) -> PartylineResult<()>;
}

/// Tunables for [`TransactionalGlm`].
#[derive(Clone, Debug)]
pub struct GlobalLockConfig {
    /// TTL stamped on every written record so entries from dead nodes
    /// expire. Default 30 minutes.
    pub ttl: Duration,
    /// Pause between admit attempts while the path is contended or the
    /// store reports a retryable failure. Default 1 second.
    pub retry_interval: Duration,
    /// Timeout applied when a caller passes zero. Default 5 minutes.
    pub default_timeout: Duration,
}

impl Default for GlobalLockConfig {
    fn default() -> Self {
        GlobalLockConfig {
            ttl: Duration::from_secs(30 * 60),
            retry_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Global lock manager backed by a replicated transactional store.
///
/// Each admit attempt is a single transaction: read the record, decide,
/// write, commit. Contention and retryable store failures back off and
/// retry against the caller's deadline; a store without transaction
/// support is fatal so callers do not spin.
///
/// Overlapping local readers of one path are reference-counted per node:
/// the node joins the global owner set once and leaves it only when the
/// last local reader releases.
pub struct TransactionalGlm<S> {
    store: Arc<S>,
    node: NodeId,
    config: GlobalLockConfig,
    read_refs: Mutex<HashMap<String, usize>>,
}

impl<S: TxKvStore> TransactionalGlm<S> {
    /// Manager for `node` over `store` with default tunables.
    pub fn new(store: Arc<S>, node: NodeId) -> Self {
        Self::with_config(store, node, GlobalLockConfig::default())
    }

    /// Manager with explicit tunables.
    pub fn with_config(store: Arc<S>, node: NodeId, config: GlobalLockConfig) -> Self {
        TransactionalGlm {
            store,
            node,
            config,
            read_refs: Mutex::new(HashMap::new()),
        }
    }

    /// This node's identity in the owner sets.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// One admit attempt in a single transaction.
    ///
    /// Pure with respect to timing: retry scheduling lives in
    /// [`try_lock`](GlobalLockManager::try_lock).
    fn attempt(&self, path: &str, level: LockLevel) -> Result<bool, StoreError> {
        let mut txn = self.store.begin()?;

        let admitted = match txn.get(path)? {
            None => {
                let record = GlobalLockOwner::new(level, self.node.clone());
                txn.put(path, encode(&record)?, Some(self.config.ttl))?;
                true
            }
            Some(raw) => {
                let mut record = decode(&raw)?;
                if record.level == LockLevel::Read && level == LockLevel::Read {
                    if !record.contains(&self.node) {
                        record.add(self.node.clone());
                        txn.put(path, encode(&record)?, Some(self.config.ttl))?;
                    }
                    true
                } else {
                    tracing::trace!(
                        "'{}': global {} held by {:?}, {} not admitted",
                        path,
                        record.level,
                        record.owners,
                        level
                    );
                    false
                }
            }
        };

        txn.commit()?;
        Ok(admitted)
    }

    /// Removes the record for `path` regardless of owners (write/delete
    /// release).
    fn remove_record(&self, path: &str) -> PartylineResult<()> {
        self.with_retries(path, |glm| {
            let mut txn = glm.store.begin()?;
            txn.delete(path)?;
            txn.commit()
        })
    }

    /// Transactionally removes this node from the reader set, dropping
    /// the record when the set empties.
    fn leave_reader_set(&self, path: &str) -> PartylineResult<()> {
        self.with_retries(path, |glm| {
            let mut txn = glm.store.begin()?;
            match txn.get(path)? {
                None => {}
                Some(raw) => {
                    let mut record = decode(&raw)?;
                    if record.contains(&glm.node) {
                        record.remove(&glm.node);
                        if record.is_empty() {
                            txn.delete(path)?;
                        } else {
                            txn.put(path, encode(&record)?, Some(glm.config.ttl))?;
                        }
                    }
                }
            }
            txn.commit()
        })
    }

    /// Runs `op` until it commits, a bounded number of retryable failures
    /// pass, or a fatal error surfaces. An exhausted unlock is logged and
    /// left to the TTL.
    fn with_retries(
        &self,
        path: &str,
        op: impl Fn(&Self) -> Result<(), StoreError>,
    ) -> PartylineResult<()> {
        const UNLOCK_ATTEMPTS: u32 = 16;

        for attempt in 0..UNLOCK_ATTEMPTS {
            match op(self) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        "global unlock of '{}' failed (attempt {}): {}",
                        path,
                        attempt + 1,
                        err
                    );
                }
                Err(err) => return Err(fatal_store(err)),
            }
            thread::sleep(self.config.retry_interval);
        }

        tracing::error!(
            "giving up releasing global lock on '{}'; the TTL will reap it",
            path
        );
        Ok(())
    }
}

impl<S: TxKvStore> GlobalLockManager for TransactionalGlm<S> {
    fn try_lock(
        &self,
        path: &str,
        level: LockLevel,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<bool> {
        let timeout = if timeout.is_zero() {
            self.config.default_timeout
        } else {
            timeout
        };
        let deadline = Deadline::after(timeout);

        if level == LockLevel::Read {
            let mut refs = lock_refs(&self.read_refs);
            if let Some(count) = refs.get_mut(path) {
                *count += 1;
                return Ok(true);
            }
        }

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                tracing::debug!("'{}': global {} request cancelled", path, level);
                return Err(PartylineError::Cancelled(path.to_string()));
            }

            match self.attempt(path, level) {
                Ok(true) => {
                    if level == LockLevel::Read {
                        *lock_refs(&self.read_refs)
                            .entry(path.to_string())
                            .or_insert(0) += 1;
                    }
                    tracing::debug!("'{}': node '{}' holds global {}", path, self.node, level);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!("global lock attempt on '{}' failed: {}", path, err);
                }
                Err(err) => return Err(fatal_store(err)),
            }

            let Some(remaining) = deadline.remaining() else {
                tracing::debug!("'{}': global {} not acquired before deadline", path, level);
                return Ok(false);
            };
            thread::sleep(self.config.retry_interval.min(remaining));
        }
    }

    fn unlock(&self, path: &str, level: LockLevel) -> PartylineResult<()> {
        match level {
            LockLevel::Write | LockLevel::Delete => {
                tracing::debug!("'{}': node '{}' releases global {}", path, self.node, level);
                self.remove_record(path)
            }
            LockLevel::Read => {
                {
                    let mut refs = lock_refs(&self.read_refs);
                    if let Some(count) = refs.get_mut(path) {
                        *count -= 1;
                        if *count > 0 {
                            return Ok(());
                        }
                        refs.remove(path);
                    }
                }
                tracing::debug!("'{}': node '{}' leaves global reader set", path, self.node);
                self.leave_reader_set(path)
            }
        }
    }
}

fn lock_refs(refs: &Mutex<HashMap<String, usize>>) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
    match refs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn fatal_store(err: StoreError) -> PartylineError {
    PartylineError::Fatal(format!("global lock store cannot recover: {}; do not retry", err))
}

fn encode(record: &GlobalLockOwner) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(record).map_err(|e| StoreError::Backend(e.to_string()))
}

fn decode(raw: &[u8]) -> Result<GlobalLockOwner, StoreError> {
    bincode::deserialize(raw).map_err(|e| StoreError::Backend(e.to_string()))
}
