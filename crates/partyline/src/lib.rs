#![warn(missing_docs)]

//! Partyline: concurrent, joinable file access coordination.
//!
//! Many threads in one process read, write, and delete the same files
//! through a [`JoinableFileManager`]. A write locks its path but exposes a
//! joinable stream that late readers can tail in order; a delete waits for
//! every holder to drain first. An optional [`GlobalLockManager`]
//! serializes exclusive access across nodes through a transactional
//! key-value store.

pub mod file_tree;
pub mod global;
pub mod joinable;
pub mod lock_owner;
pub mod manager;
pub mod types;

pub use file_tree::{Admission, CancelToken, FileTree, LockSnapshot};
pub use global::{GlobalLockConfig, GlobalLockManager, GlobalLockOwner, TransactionalGlm};
pub use joinable::{JoinableFile, JoinableReader, JoinableWriter, StreamState};
pub use lock_owner::{current_owner_name, LockOwner};
pub use manager::{JoinableFileManager, ReadHandle, WriteHandle};
pub use types::{Deadline, LockLevel, NodeId, PartylineError, PartylineResult};
