//! Transactional key-value store used by the global lock manager.
//!
//! The lock manager needs begin/commit/rollback with reads, writes, and
//! deletes inside one transaction, plus a coarse per-key TTL so entries
//! written by dead nodes cannot pin a key forever. [`MemoryTxStore`] is the
//! in-process implementation; a replicated backend plugs in behind the same
//! traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{StoreError, StoreResult};

/// Value type stored against each key.
pub type Value = Vec<u8>;

/// A single open transaction against a [`TxKvStore`].
///
/// Reads observe the committed state overlaid with the transaction's own
/// buffered writes. `commit` applies every buffered write atomically or
/// fails with a retryable [`StoreError::TxnConflict`] when a key read by
/// this transaction was committed by another in the meantime.
pub trait KvTransaction {
    /// Reads a key. Returns None when the key is absent or expired.
    fn get(&mut self, key: &str) -> StoreResult<Option<Value>>;

    /// Buffers a write, with an optional time-to-live applied at commit.
    fn put(&mut self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Buffers a delete.
    fn delete(&mut self, key: &str) -> StoreResult<()>;

    /// Atomically applies all buffered writes.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards all buffered writes.
    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// A key-value store with transactions and per-key expiry.
pub trait TxKvStore: Send + Sync {
    /// Opens a new transaction.
    fn begin(&self) -> StoreResult<Box<dyn KvTransaction + '_>>;
}

#[derive(Clone)]
struct Entry {
    value: Value,
    version: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory transactional store backed by a `BTreeMap`. Thread-safe.
///
/// Transactions are optimistic: reads record the version of each key they
/// observed, and commit re-validates those versions under the store mutex.
/// A mismatch fails the commit with [`StoreError::TxnConflict`] so the
/// caller can retry. Expired entries are treated as absent and purged
/// lazily. Data does not persist across process restarts.
pub struct MemoryTxStore {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    next_version: AtomicU64,
}

impl MemoryTxStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            next_version: AtomicU64::new(1),
        }
    }

    /// Returns true if the key currently exists and has not expired.
    pub fn contains_key(&self, key: &str) -> bool {
        let entries = self.lock_entries();
        let now = Instant::now();
        entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let entries = self.lock_entries();
        let now = Instant::now();
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// True when no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        // Lock poisoning only happens if a writer panicked mid-update; the
        // map itself is always structurally intact, so keep going.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live_version(entries: &BTreeMap<String, Entry>, key: &str, now: Instant) -> Option<u64> {
        entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.version)
    }
}

impl Default for MemoryTxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TxKvStore for MemoryTxStore {
    fn begin(&self) -> StoreResult<Box<dyn KvTransaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }
}

/// Buffered write: `None` is a delete, `Some` a put with its TTL.
type PendingWrite = Option<(Value, Option<Duration>)>;

struct MemoryTransaction<'a> {
    store: &'a MemoryTxStore,
    /// Version observed for each key at first read; None means absent.
    reads: HashMap<String, Option<u64>>,
    writes: BTreeMap<String, PendingWrite>,
}

impl KvTransaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &str) -> StoreResult<Option<Value>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.as_ref().map(|(value, _)| value.clone()));
        }

        let entries = self.store.lock_entries();
        let now = Instant::now();
        let live = entries.get(key).filter(|e| !e.is_expired(now));
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| live.map(|e| e.version));
        Ok(live.map(|e| e.value.clone()))
    }

    fn put(&mut self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.writes.insert(key.to_string(), Some((value, ttl)));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StoreResult<()> {
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let mut entries = this.store.lock_entries();
        let now = Instant::now();

        for (key, observed) in &this.reads {
            let current = MemoryTxStore::live_version(&entries, key, now);
            if current != *observed {
                tracing::trace!("commit conflict on '{}'", key);
                return Err(StoreError::TxnConflict { key: key.clone() });
            }
        }

        for (key, pending) in this.writes {
            match pending {
                Some((value, ttl)) => {
                    let version = this.store.next_version.fetch_add(1, Ordering::Relaxed);
                    entries.insert(
                        key,
                        Entry {
                            value,
                            version,
                            expires_at: ttl.and_then(|d| now.checked_add(d)),
                        },
                    );
                }
                None => {
                    entries.remove(&key);
                }
            }
        }

        entries.retain(|_, e| !e.is_expired(now));
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
