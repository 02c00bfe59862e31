//! Reference counting for a single locked path.

use crate::types::LockLevel;

/// Owner name for the calling thread: its name when set, otherwise a
/// stable rendering of its id.
pub fn current_owner_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// Tracks who holds references on one locked path and at what level.
///
/// The level is fixed for the owner's lifetime. References are keyed by
/// owner name in insertion order; re-locking under an already-present name
/// replaces its label rather than adding a reference. When the last
/// reference is removed the owner is terminal and must be dropped from the
/// registry together with its entry.
///
/// Serialization of calls is the registry's duty; this type itself never
/// blocks and never fails; it rejects by returning `false`.
#[derive(Debug)]
pub struct LockOwner {
    path: String,
    level: LockLevel,
    thread_label: String,
    refs: Vec<(String, String)>,
}

impl LockOwner {
    /// Creates the owner with its first reference installed.
    pub fn new(path: &str, owner_name: &str, label: &str, level: LockLevel) -> Self {
        let mut owner = LockOwner {
            path: path.to_string(),
            level,
            thread_label: format!("{}({})", current_owner_name(), label),
            refs: Vec::new(),
        };
        owner.insert_ref(owner_name, label);
        owner
    }

    /// The fixed lock level.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Number of live references.
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// True while any reference is held.
    pub fn is_locked(&self) -> bool {
        !self.refs.is_empty()
    }

    /// Attempts to add a reference at `requested`.
    ///
    /// Admits only when the compatibility rules allow it (Read against a
    /// Read or Write holder); on admit the reference is recorded and the
    /// call returns true.
    pub fn try_join(&mut self, owner_name: &str, label: &str, requested: LockLevel) -> bool {
        if !self.level.admits(requested) {
            return false;
        }
        self.insert_ref(owner_name, label);
        true
    }

    /// Removes the reference held under `owner_name`.
    ///
    /// Returns true exactly when no references remain afterwards, making
    /// the owner terminal.
    pub fn unlock(&mut self, owner_name: &str) -> bool {
        if let Some(pos) = self.refs.iter().position(|(name, _)| name == owner_name) {
            let (_, label) = self.refs.remove(pos);
            tracing::trace!(
                "'{}': removed ref '{}' ({}), {} remaining",
                self.path,
                owner_name,
                label,
                self.refs.len()
            );
        }
        self.refs.is_empty()
    }

    /// Diagnostic snapshot: level, originating thread, count, and the
    /// references in insertion order.
    pub fn lock_info(&self) -> String {
        let mut info = format!(
            "Lock level: {}\nThread: {}\nLock count: {}\nReferences:",
            self.level,
            self.thread_label,
            self.refs.len()
        );
        for (name, label) in &self.refs {
            info.push_str("\n  ");
            info.push_str(name);
            info.push_str(": ");
            info.push_str(label);
        }
        info
    }

    fn insert_ref(&mut self, owner_name: &str, label: &str) {
        match self.refs.iter_mut().find(|(name, _)| name == owner_name) {
            Some((_, existing)) => *existing = label.to_string(),
            None => self.refs.push((owner_name.to_string(), label.to_string())),
        }
        tracing::trace!(
            "'{}': ref '{}' ({}), count now {}",
            self.path,
            owner_name,
            label,
            self.refs.len()
        );
    }
}
