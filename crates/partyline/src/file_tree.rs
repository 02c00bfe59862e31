//! The authoritative in-process registry of locked paths.
//!
//! One monitor guards the registry: admissions on a path are serialized,
//! blocked acquirers park on the condvar, and every release notifies it.
//! The sorted map doubles as a prefix index, so the descendant check a
//! delete needs is a key-range scan rather than a full walk.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::joinable::JoinableFile;
use crate::lock_owner::LockOwner;
use crate::types::{Deadline, LockLevel, PartylineError, PartylineResult};

struct PathEntry {
    owner: LockOwner,
    joinable: Option<Arc<JoinableFile>>,
}

/// How a successful acquisition was admitted.
#[derive(Debug)]
pub enum Admission {
    /// Admitted with no stream attached: a fresh Read or Delete owner, or
    /// a Read shared with existing readers.
    Direct,
    /// Admitted as the writer of a newly created stream.
    NewStream(Arc<JoinableFile>),
    /// Admitted as a reader joined to the in-progress stream.
    JoinedStream(Arc<JoinableFile>),
}

/// Diagnostic snapshot of one locked path.
#[derive(Clone, Debug)]
pub struct LockSnapshot {
    /// The locked path.
    pub path: String,
    /// Level held.
    pub level: LockLevel,
    /// Live reference count.
    pub refs: usize,
}

/// Cooperative cancellation for blocked acquisitions.
///
/// Cancelling wakes every parked acquirer; those observing the token
/// unwind without leaving a reference behind and report
/// [`PartylineError::Cancelled`].
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    tree: Arc<FileTree>,
}

impl CancelToken {
    /// Signals cancellation and wakes all parked acquirers.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.tree.released.notify_all();
    }

    /// True once [`cancel`](CancelToken::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// In-process registry mapping locked paths to their owners and, for
/// in-progress writes, their joinable streams.
pub struct FileTree {
    entries: Mutex<BTreeMap<String, PathEntry>>,
    released: Condvar,
}

impl FileTree {
    /// Creates an empty registry.
    pub fn new() -> Self {
        FileTree {
            entries: Mutex::new(BTreeMap::new()),
            released: Condvar::new(),
        }
    }

    /// Creates a cancellation token bound to this registry.
    pub fn cancel_token(self: &Arc<Self>) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            tree: Arc::clone(self),
        }
    }

    /// Attempts to admit `owner_name` at `level` on `path`, parking until
    /// `deadline` while an incompatible holder is present.
    ///
    /// Outcomes follow the admit rules: a free path installs a fresh
    /// owner (creating the joinable stream for Write); a compatible
    /// holder admits a joined reference; Delete is refused outright while
    /// any descendant of `path` is locked; everything else waits for a
    /// release and retries, timing out at the deadline.
    pub fn try_acquire(
        &self,
        path: &str,
        level: LockLevel,
        owner_name: &str,
        label: &str,
        deadline: Deadline,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<Admission> {
        let mut entries = self.lock_entries();
        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(PartylineError::Cancelled(path.to_string()));
            }

            if level == LockLevel::Delete && Self::descendant_locked(&entries, path) {
                return Err(PartylineError::Denied {
                    path: path.to_string(),
                    level,
                    reason: "descendant paths are locked".to_string(),
                });
            }

            match entries.get_mut(path) {
                None => {
                    let joinable = if level == LockLevel::Write {
                        Some(Arc::new(JoinableFile::create(Path::new(path))?))
                    } else {
                        None
                    };
                    let admission = match &joinable {
                        Some(stream) => Admission::NewStream(Arc::clone(stream)),
                        None => Admission::Direct,
                    };
                    let owner = LockOwner::new(path, owner_name, label, level);
                    entries.insert(path.to_string(), PathEntry { owner, joinable });
                    tracing::debug!("'{}': admitted fresh {} owner '{}'", path, level, owner_name);
                    return Ok(admission);
                }
                Some(entry) => {
                    if entry.owner.try_join(owner_name, label, level) {
                        tracing::debug!(
                            "'{}': joined '{}' at {} under {} owner",
                            path,
                            owner_name,
                            level,
                            entry.owner.level()
                        );
                        return Ok(match &entry.joinable {
                            Some(stream) => Admission::JoinedStream(Arc::clone(stream)),
                            None => Admission::Direct,
                        });
                    }
                }
            }

            let Some(remaining) = deadline.remaining() else {
                tracing::debug!("'{}': {} request by '{}' timed out", path, level, owner_name);
                return Err(PartylineError::TimedOut {
                    path: path.to_string(),
                    level,
                });
            };
            entries = match self.released.wait_timeout(entries, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Removes `owner_name`'s reference on `path`.
    ///
    /// A terminal owner is removed together with its entry, the joinable
    /// stream (if any) is closed so straggling readers drain, and all
    /// waiters are notified. Returns true when the entry was removed.
    pub fn release(&self, path: &str, owner_name: &str) -> bool {
        let mut entries = self.lock_entries();
        let removed = match entries.get_mut(path) {
            None => false,
            Some(entry) => {
                if entry.owner.unlock(owner_name) {
                    let entry = entries.remove(path);
                    if let Some(stream) = entry.and_then(|e| e.joinable) {
                        stream.close();
                    }
                    tracing::debug!("'{}': last reference released, entry removed", path);
                    true
                } else {
                    false
                }
            }
        };
        drop(entries);
        self.released.notify_all();
        removed
    }

    /// True while any strict descendant of `path` is locked.
    pub fn prefix_locked(&self, path: &str) -> bool {
        Self::descendant_locked(&self.lock_entries(), path)
    }

    /// Parks until the lock state of `path` admits `level` (or the path
    /// is unlocked entirely). False on deadline or cancellation.
    pub fn wait_for(
        &self,
        path: &str,
        level: LockLevel,
        deadline: Deadline,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let mut entries = self.lock_entries();
        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return false;
            }
            let compatible = match entries.get(path) {
                None => true,
                Some(entry) => !entry.owner.is_locked() || entry.owner.level().admits(level),
            };
            if compatible {
                return true;
            }
            let Some(remaining) = deadline.remaining() else {
                return false;
            };
            entries = match self.released.wait_timeout(entries, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Diagnostic snapshot of the owner on `path`, if any.
    pub fn lock_info(&self, path: &str) -> Option<String> {
        self.lock_entries().get(path).map(|e| e.owner.lock_info())
    }

    /// True while `path` itself is locked.
    pub fn is_locked(&self, path: &str) -> bool {
        self.lock_entries()
            .get(path)
            .is_some_and(|e| e.owner.is_locked())
    }

    /// Snapshot of every locked path.
    pub fn active_locks(&self) -> Vec<LockSnapshot> {
        self.lock_entries()
            .iter()
            .map(|(path, entry)| LockSnapshot {
                path: path.clone(),
                level: entry.owner.level(),
                refs: entry.owner.ref_count(),
            })
            .collect()
    }

    /// True when no path is locked.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    fn descendant_locked(entries: &BTreeMap<String, PathEntry>, path: &str) -> bool {
        let prefix = format!("{}{}", path, MAIN_SEPARATOR);
        entries
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .any(|(_, entry)| entry.owner.is_locked())
    }

    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, PathEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}
