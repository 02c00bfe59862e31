//! The coordination façade: open streams, delete files, wait on locks.
//!
//! Every operation computes one absolute deadline at entry and spends it
//! across the global (when configured) and local acquisitions. Failures
//! and cancellations unwind any partial acquisition before surfacing, so
//! no lock outlives its operation. Stream handles release their locks on
//! close, falling back to drop.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::file_tree::{Admission, CancelToken, FileTree, LockSnapshot};
use crate::global::GlobalLockManager;
use crate::joinable::{JoinableReader, JoinableWriter};
use crate::lock_owner::current_owner_name;
use crate::types::{Deadline, LockLevel, PartylineError, PartylineResult};

/// Coordinates concurrent access to files for one process.
///
/// Lock references are keyed by owner name, defaulting to the calling
/// thread's name: a thread re-acquiring a path it already holds shares
/// its existing reference rather than stacking a new one.
pub struct JoinableFileManager {
    tree: Arc<FileTree>,
    global: Option<Arc<dyn GlobalLockManager>>,
}

impl JoinableFileManager {
    /// Manager with no cluster-wide coordination.
    pub fn new() -> Self {
        JoinableFileManager {
            tree: Arc::new(FileTree::new()),
            global: None,
        }
    }

    /// Manager that consults `global` before write and delete
    /// transitions (and for non-joined reads).
    pub fn with_global(global: Arc<dyn GlobalLockManager>) -> Self {
        JoinableFileManager {
            tree: Arc::new(FileTree::new()),
            global: Some(global),
        }
    }

    /// Creates a cancellation token honored by the `*_with` operations.
    pub fn cancel_token(&self) -> CancelToken {
        self.tree.cancel_token()
    }

    /// Opens a writable stream over `path`, waiting up to `timeout` for
    /// exclusivity.
    ///
    /// Readers arriving while the stream is open join it and tail the
    /// written bytes in order. The returned handle releases the local
    /// then the global lock when closed or dropped.
    pub fn open_output_stream(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> PartylineResult<WriteHandle> {
        self.open_output_stream_with(path, timeout, None)
    }

    /// [`open_output_stream`](Self::open_output_stream) with a
    /// cancellation token.
    pub fn open_output_stream_with(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<WriteHandle> {
        let key = path_key(path.as_ref());
        let deadline = Deadline::after(timeout);
        let owner = current_owner_name();

        let global_held = self.acquire_global(&key, LockLevel::Write, deadline, cancel)?;

        let admission =
            match self
                .tree
                .try_acquire(&key, LockLevel::Write, &owner, "write", deadline, cancel)
            {
                Ok(admission) => admission,
                Err(err) => {
                    self.release_global(&key, LockLevel::Write, global_held);
                    return Err(err);
                }
            };

        let Admission::NewStream(stream) = admission else {
            // A Write admit is always fresh; anything else means the
            // registry broke its own rules.
            self.tree.release(&key, &owner);
            self.release_global(&key, LockLevel::Write, global_held);
            return Err(PartylineError::Fatal(format!(
                "write admit on '{}' joined an existing owner",
                key
            )));
        };

        tracing::debug!("'{}': output stream opened by '{}'", key, owner);
        Ok(WriteHandle {
            writer: JoinableWriter::new(stream),
            guard: Some(self.guard(key, owner, global_held.then_some(LockLevel::Write))),
        })
    }

    /// Opens a readable stream over `path`, waiting up to `timeout`.
    ///
    /// A path with an in-progress write admits the reader into its
    /// joinable stream; otherwise the file is opened directly under a
    /// Read lock. Returns [`PartylineError::NotFound`] when the file does
    /// not exist and no stream is joinable.
    pub fn open_input_stream(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> PartylineResult<ReadHandle> {
        self.open_input_stream_with(path, timeout, None)
    }

    /// [`open_input_stream`](Self::open_input_stream) with a cancellation
    /// token.
    pub fn open_input_stream_with(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<ReadHandle> {
        let key = path_key(path.as_ref());
        let deadline = Deadline::after(timeout);
        let owner = current_owner_name();

        let admission =
            self.tree
                .try_acquire(&key, LockLevel::Read, &owner, "read", deadline, cancel)?;

        match admission {
            Admission::JoinedStream(stream) => match stream.open_reader(0) {
                Ok(reader) => {
                    tracing::debug!("'{}': reader '{}' joined the live stream", key, owner);
                    Ok(ReadHandle {
                        source: ReadSource::Joined(reader),
                        guard: Some(self.guard(key, owner, None)),
                    })
                }
                Err(err) => {
                    self.tree.release(&key, &owner);
                    Err(err.into())
                }
            },
            Admission::Direct => {
                // Not joined to a stream, so global coordination applies.
                let global_held = match self.acquire_global(&key, LockLevel::Read, deadline, cancel)
                {
                    Ok(held) => held,
                    Err(err) => {
                        self.tree.release(&key, &owner);
                        return Err(err);
                    }
                };
                match File::open(path.as_ref()) {
                    Ok(file) => {
                        tracing::debug!("'{}': reader '{}' opened the file", key, owner);
                        Ok(ReadHandle {
                            source: ReadSource::Direct(file),
                            guard: Some(self.guard(
                                key,
                                owner,
                                global_held.then_some(LockLevel::Read),
                            )),
                        })
                    }
                    Err(err) => {
                        self.tree.release(&key, &owner);
                        self.release_global(&key, LockLevel::Read, global_held);
                        if err.kind() == io::ErrorKind::NotFound {
                            Err(PartylineError::NotFound(key))
                        } else {
                            Err(err.into())
                        }
                    }
                }
            }
            Admission::NewStream(_) => {
                self.tree.release(&key, &owner);
                Err(PartylineError::Fatal(format!(
                    "read admit on '{}' created a stream",
                    key
                )))
            }
        }
    }

    /// Deletes `path`, waiting up to `timeout` for every holder to drain.
    ///
    /// Requires full exclusivity: no readers, no writer, and no locked
    /// descendant paths. A file that is already absent deletes
    /// idempotently. Returns true when the path no longer exists.
    pub fn try_delete(&self, path: impl AsRef<Path>, timeout: Duration) -> PartylineResult<bool> {
        self.try_delete_with(path, timeout, None)
    }

    /// [`try_delete`](Self::try_delete) with a cancellation token.
    pub fn try_delete_with(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<bool> {
        let key = path_key(path.as_ref());
        let deadline = Deadline::after(timeout);
        let owner = current_owner_name();

        let global_held = self.acquire_global(&key, LockLevel::Delete, deadline, cancel)?;

        if let Err(err) =
            self.tree
                .try_acquire(&key, LockLevel::Delete, &owner, "delete", deadline, cancel)
        {
            self.release_global(&key, LockLevel::Delete, global_held);
            return Err(err);
        }

        let result = match fs::remove_file(path.as_ref()) {
            Ok(()) => {
                tracing::info!("deleted '{}'", key);
                Ok(true)
            }
            // Absent already: deletion is idempotent.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => {
                tracing::error!("failed to delete '{}': {}", key, err);
                Err(PartylineError::Io(err))
            }
        };

        self.tree.release(&key, &owner);
        self.release_global(&key, LockLevel::Delete, global_held);
        result
    }

    /// Blocks until the current lock state of `path` admits `level` (or
    /// the path is unlocked). False on timeout.
    pub fn wait_for(&self, path: impl AsRef<Path>, level: LockLevel, timeout: Duration) -> bool {
        self.wait_for_with(path, level, timeout, None)
    }

    /// [`wait_for`](Self::wait_for) with a cancellation token.
    pub fn wait_for_with(
        &self,
        path: impl AsRef<Path>,
        level: LockLevel,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> bool {
        let key = path_key(path.as_ref());
        self.tree
            .wait_for(&key, level, Deadline::after(timeout), cancel)
    }

    /// Diagnostic snapshot of the lock state of `path`, if locked.
    pub fn lock_info(&self, path: impl AsRef<Path>) -> Option<String> {
        self.tree.lock_info(&path_key(path.as_ref()))
    }

    /// True while `path` is locked at any level.
    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        self.tree.is_locked(&path_key(path.as_ref()))
    }

    /// Snapshot of every locked path.
    pub fn active_locks(&self) -> Vec<LockSnapshot> {
        self.tree.active_locks()
    }

    fn guard(&self, path: String, owner: String, global: Option<LockLevel>) -> ReleaseGuard {
        let global = match global {
            Some(level) => self.global.clone().map(|manager| (manager, level)),
            None => None,
        };
        ReleaseGuard {
            tree: Arc::clone(&self.tree),
            global,
            path,
            owner,
        }
    }

    fn acquire_global(
        &self,
        key: &str,
        level: LockLevel,
        deadline: Deadline,
        cancel: Option<&CancelToken>,
    ) -> PartylineResult<bool> {
        let Some(global) = &self.global else {
            return Ok(false);
        };
        let Some(remaining) = deadline.remaining() else {
            return Err(PartylineError::TimedOut {
                path: key.to_string(),
                level,
            });
        };
        if global.try_lock(key, level, remaining, cancel)? {
            Ok(true)
        } else {
            Err(PartylineError::TimedOut {
                path: key.to_string(),
                level,
            })
        }
    }

    fn release_global(&self, key: &str, level: LockLevel, held: bool) {
        if !held {
            return;
        }
        if let Some(global) = &self.global {
            if let Err(err) = global.unlock(key, level) {
                tracing::warn!("failed to release global {} lock on '{}': {}", level, key, err);
            }
        }
    }
}

impl Default for JoinableFileManager {
    fn default() -> Self {
        Self::new()
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Releases one owner reference: local first, then global.
struct ReleaseGuard {
    tree: Arc<FileTree>,
    global: Option<(Arc<dyn GlobalLockManager>, LockLevel)>,
    path: String,
    owner: String,
}

impl ReleaseGuard {
    fn release(self) -> PartylineResult<()> {
        self.tree.release(&self.path, &self.owner);
        if let Some((global, level)) = &self.global {
            global.unlock(&self.path, *level)?;
        }
        Ok(())
    }
}

/// Writable stream over a locked path.
///
/// Closing (or dropping) the handle closes the joinable stream, letting
/// joined readers drain to end-of-stream, and releases the local then
/// global locks.
pub struct WriteHandle {
    writer: JoinableWriter,
    guard: Option<ReleaseGuard>,
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle").finish_non_exhaustive()
    }
}

impl WriteHandle {
    /// Closes the stream and releases the locks, surfacing any release
    /// failure the drop path could only log.
    pub fn close(mut self) -> PartylineResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> PartylineResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        self.writer.close();
        guard.release()
    }
}

impl Write for WriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!("failed to release write lock on drop: {}", err);
        }
    }
}

enum ReadSource {
    Joined(JoinableReader),
    Direct(File),
}

/// Readable stream over a locked path.
///
/// Either a cursor joined to an in-progress write or a plain handle on
/// the file. Closing (or dropping) releases the locks.
pub struct ReadHandle {
    source: ReadSource,
    guard: Option<ReleaseGuard>,
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle").finish_non_exhaustive()
    }
}

impl ReadHandle {
    /// True when this reader is joined to an in-progress write.
    pub fn is_joined(&self) -> bool {
        matches!(self.source, ReadSource::Joined(_))
    }

    /// Releases the locks, surfacing any release failure the drop path
    /// could only log.
    pub fn close(mut self) -> PartylineResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> PartylineResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        guard.release()
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            ReadSource::Joined(reader) => reader.read(buf),
            ReadSource::Direct(file) => file.read(buf),
        }
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            tracing::warn!("failed to release read lock on drop: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::{GlobalLockConfig, TransactionalGlm};
    use crate::types::NodeId;
    use partyline_store::MemoryTxStore;
    use std::thread;

    const TICK: Duration = Duration::from_millis(100);

    fn fixture() -> (tempfile::TempDir, JoinableFileManager) {
        (tempfile::tempdir().unwrap(), JoinableFileManager::new())
    }

    #[test]
    fn test_write_then_read_back() {
        let (dir, manager) = fixture();
        let path = dir.path().join("data.txt");

        let mut writer = manager.open_output_stream(&path, TICK).unwrap();
        writer.write_all(b"Test data").unwrap();
        writer.close().unwrap();

        let mut reader = manager.open_input_stream(&path, TICK).unwrap();
        assert!(!reader.is_joined());
        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "Test data");
        reader.close().unwrap();

        assert!(manager.active_locks().is_empty());
    }

    #[test]
    fn test_read_missing_file_is_not_found() {
        let (dir, manager) = fixture();
        let path = dir.path().join("absent.txt");

        let err = manager.open_input_stream(&path, TICK).unwrap_err();
        assert!(matches!(err, PartylineError::NotFound(_)));
        // The failed read left no lock behind.
        assert!(manager.active_locks().is_empty());
    }

    #[test]
    fn test_delete_missing_file_is_idempotent() {
        let (dir, manager) = fixture();
        let path = dir.path().join("absent.txt");
        assert!(manager.try_delete(&path, TICK).unwrap());
    }

    #[test]
    fn test_reader_joins_live_writer() {
        let (dir, manager) = fixture();
        let manager = Arc::new(manager);
        let path = dir.path().join("stream.bin");

        let mut writer = manager.open_output_stream(&path, TICK).unwrap();
        writer.write_all(b"early ").unwrap();

        let mut reader = manager.open_input_stream(&path, TICK).unwrap();
        assert!(reader.is_joined());

        let tail = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut all = Vec::new();
                reader.read_to_end(&mut all).unwrap();
                drop(manager);
                all
            })
        };

        writer.write_all(b"late").unwrap();
        writer.close().unwrap();

        assert_eq!(tail.join().unwrap(), b"early late");
    }

    #[test]
    fn test_second_writer_denied_until_close() {
        let (dir, manager) = fixture();
        let path = dir.path().join("contended.txt");

        let writer = manager.open_output_stream(&path, TICK).unwrap();
        let err = manager
            .open_output_stream(&path, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, PartylineError::TimedOut { .. }));

        writer.close().unwrap();
        manager.open_output_stream(&path, TICK).unwrap().close().unwrap();
    }

    #[test]
    fn test_delete_blocked_by_reader() {
        let (dir, manager) = fixture();
        let path = dir.path().join("held.txt");
        fs::write(&path, b"contents").unwrap();

        let reader = manager.open_input_stream(&path, TICK).unwrap();
        let err = manager
            .try_delete(&path, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, PartylineError::TimedOut { .. }));

        reader.close().unwrap();
        assert!(manager.try_delete(&path, TICK).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_wait_for_write_level() {
        let (dir, manager) = fixture();
        let path = dir.path().join("waited.txt");
        fs::write(&path, b"x").unwrap();

        let reader = manager.open_input_stream(&path, TICK).unwrap();
        assert!(!manager.wait_for(&path, LockLevel::Write, Duration::from_millis(50)));
        reader.close().unwrap();
        assert!(manager.wait_for(&path, LockLevel::Write, TICK));
    }

    #[test]
    fn test_cancel_unwinds_waiting_writer() {
        let (dir, manager) = fixture();
        let manager = Arc::new(manager);
        let path = dir.path().join("cancelled.txt");

        let writer = manager.open_output_stream(&path, TICK).unwrap();
        let token = manager.cancel_token();

        let blocked = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            let path = path.clone();
            thread::spawn(move || {
                manager.open_output_stream_with(&path, Duration::from_secs(30), Some(&token))
            })
        };

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        let err = blocked.join().unwrap().unwrap_err();
        assert!(matches!(err, PartylineError::Cancelled(_)));

        writer.close().unwrap();
        assert!(manager.active_locks().is_empty());
    }

    #[test]
    fn test_lock_info_reports_holder() {
        let (dir, manager) = fixture();
        let path = dir.path().join("info.txt");

        let writer = manager.open_output_stream(&path, TICK).unwrap();
        let info = manager.lock_info(&path).unwrap();
        assert!(info.contains("Lock level: write"));
        assert!(manager.is_locked(&path));

        writer.close().unwrap();
        assert!(manager.lock_info(&path).is_none());
    }

    #[test]
    fn test_dropped_writer_releases_locks() {
        let (dir, manager) = fixture();
        let path = dir.path().join("dropped.txt");

        {
            let mut writer = manager.open_output_stream(&path, TICK).unwrap();
            writer.write_all(b"x").unwrap();
        }
        assert!(manager.active_locks().is_empty());
        manager.open_output_stream(&path, TICK).unwrap().close().unwrap();
    }

    #[test]
    fn test_cancel_unblocks_contended_global_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTxStore::new());
        let config = GlobalLockConfig {
            retry_interval: Duration::from_millis(5),
            ..GlobalLockConfig::default()
        };
        let manager_a = JoinableFileManager::with_global(Arc::new(TransactionalGlm::with_config(
            Arc::clone(&store),
            NodeId::new("node-a"),
            config.clone(),
        )));
        let manager_b = Arc::new(JoinableFileManager::with_global(Arc::new(
            TransactionalGlm::with_config(Arc::clone(&store), NodeId::new("node-b"), config),
        )));
        let path = dir.path().join("contended.txt");

        let writer = manager_a.open_output_stream(&path, TICK).unwrap();

        // b parks on the contended global Write lock, not the local tree.
        let token = manager_b.cancel_token();
        let blocked = {
            let manager_b = Arc::clone(&manager_b);
            let token = token.clone();
            let path = path.clone();
            thread::spawn(move || {
                manager_b.open_output_stream_with(&path, Duration::from_secs(30), Some(&token))
            })
        };

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        let err = blocked.join().unwrap().unwrap_err();
        assert!(matches!(err, PartylineError::Cancelled(_)));

        // The cancelled caller left no local or global state behind.
        assert!(manager_b.active_locks().is_empty());
        writer.close().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_global_locks_released_with_handles() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTxStore::new());
        let config = GlobalLockConfig {
            retry_interval: Duration::from_millis(5),
            ..GlobalLockConfig::default()
        };
        let glm = Arc::new(TransactionalGlm::with_config(
            Arc::clone(&store),
            NodeId::new("node-a"),
            config,
        ));
        let manager = JoinableFileManager::with_global(glm);
        let path = dir.path().join("global.txt");
        let key = path.to_string_lossy().into_owned();

        let mut writer = manager.open_output_stream(&path, TICK).unwrap();
        writer.write_all(b"x").unwrap();
        assert!(store.contains_key(&key));
        writer.close().unwrap();
        assert!(!store.contains_key(&key));

        let reader = manager.open_input_stream(&path, TICK).unwrap();
        assert!(store.contains_key(&key));
        reader.close().unwrap();
        assert!(!store.contains_key(&key));

        assert!(manager.try_delete(&path, TICK).unwrap());
        assert!(!store.contains_key(&key));
    }
}
