//! Core identifiers, lock levels, errors, and timing helpers.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Lock level requested or held on a path.
///
/// Levels are ordered by exclusivity: `Read < Write < Delete`.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LockLevel {
    /// Shared access: any number of readers may hold it together.
    Read,
    /// Exclusive producer access. Additional readers are still admitted,
    /// joined to the in-progress output stream.
    Write,
    /// Fully exclusive: admitted only on an unlocked path and admits
    /// nothing else afterwards until released.
    Delete,
}

impl LockLevel {
    /// Whether a holder at `self` admits a new request at `requested`.
    ///
    /// Only Read requests are ever admitted against an existing holder:
    /// shared with Read, or joined to the output stream under Write.
    /// Delete admits nothing.
    pub fn admits(self, requested: LockLevel) -> bool {
        matches!(
            (self, requested),
            (LockLevel::Read, LockLevel::Read) | (LockLevel::Write, LockLevel::Read)
        )
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockLevel::Read => write!(f, "read"),
            LockLevel::Write => write!(f, "write"),
            LockLevel::Delete => write!(f, "delete"),
        }
    }
}

/// Identity of a node participating in global locking.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from a caller-supplied string (host name, pod
    /// name, or any stable cluster-unique identifier).
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Generates a random node id for callers without a stable identity.
    pub fn generate() -> Self {
        NodeId(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for coordinator operations.
pub type PartylineResult<T> = Result<T, PartylineError>;

/// Error variants surfaced by the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum PartylineError {
    /// Deadline reached before the lock could be admitted. Recoverable;
    /// retry with a fresh deadline.
    #[error("timed out acquiring {level} lock on '{path}'")]
    TimedOut {
        /// The contended path.
        path: String,
        /// The level that was requested.
        level: LockLevel,
    },

    /// The compatibility rules forbid admission and waiting cannot help
    /// without another caller releasing first.
    #[error("{level} lock denied on '{path}': {reason}")]
    Denied {
        /// The path the request was made against.
        path: String,
        /// The level that was requested.
        level: LockLevel,
        /// Why the request cannot be admitted.
        reason: String,
    },

    /// The path does not exist and no in-progress write is joinable.
    #[error("'{0}' not found")]
    NotFound(String),

    /// The caller cancelled the operation; any partial acquisition has
    /// been unwound.
    #[error("operation cancelled on '{0}'")]
    Cancelled(String),

    /// Underlying file I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Non-recoverable condition (missing transaction support in the
    /// global store, or a broken internal invariant). Do not retry.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Absolute deadline computed once at operation entry.
///
/// Every blocking site of one operation consumes the same deadline, so a
/// multi-step acquisition (global lock, then local lock) shares a single
/// time budget.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now. Saturates far in the future on
    /// overflow, so `Duration::MAX` behaves as "no deadline".
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let end = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365));
        Deadline { end }
    }

    /// Remaining time budget, or None once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if now >= self.end {
            None
        } else {
            Some(self.end - now)
        }
    }

    /// True once the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining().is_none()
    }
}
