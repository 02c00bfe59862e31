//! One writer, many readers over a file while it is being produced.
//!
//! The writer appends to the underlying file and publishes a monotone
//! `written` frontier; any number of readers tail the frontier through
//! their own cursors and read-only file handles. Bytes live on disk (the
//! writer flushes before publishing), so memory stays bounded no matter
//! how far a reader lags.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Lifecycle of the shared stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// The writer is live; readers at the frontier park for more bytes.
    Open,
    /// The writer hit an I/O failure; reads past the frontier fail.
    ErroredClosed,
    /// The writer finished; readers drain to end-of-stream.
    Closed,
}

struct JoinState {
    /// Writer handle; present exactly while the stream is `Open`.
    file: Option<File>,
    /// Bytes durably appended and visible to readers. Never decreases.
    written: u64,
    state: StreamState,
    error: Option<String>,
    readers: usize,
}

/// An append-only view of a file being written, joinable by readers.
///
/// Created by the registry when a Write lock is admitted. The single
/// writer drives [`append`](JoinableFile::append) and
/// [`close`](JoinableFile::close); readers opened through
/// [`open_reader`](JoinableFile::open_reader) each carry an independent
/// cursor bounded by the published frontier.
pub struct JoinableFile {
    path: PathBuf,
    inner: Mutex<JoinState>,
    frontier: Condvar,
}

impl JoinableFile {
    /// Creates (truncating) the underlying file and an open stream on it.
    pub fn create(path: &Path) -> io::Result<JoinableFile> {
        let file = File::create(path)?;
        tracing::debug!("opened joinable stream on '{}'", path.display());
        Ok(JoinableFile {
            path: path.to_path_buf(),
            inner: Mutex::new(JoinState {
                file: Some(file),
                written: 0,
                state: StreamState::Open,
                error: None,
                readers: 0,
            }),
            frontier: Condvar::new(),
        })
    }

    /// The path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes published so far.
    pub fn written(&self) -> u64 {
        self.lock_state().written
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.lock_state().state
    }

    /// Number of readers currently joined.
    pub fn reader_count(&self) -> usize {
        self.lock_state().readers
    }

    /// Appends `buf` to the file and publishes it to readers.
    ///
    /// The bytes are written and flushed before the frontier advances, so
    /// a reader woken by this append can always re-read them from disk.
    /// On failure the stream transitions to [`StreamState::ErroredClosed`]
    /// without advancing the frontier: readers never observe a partial
    /// append.
    pub fn append(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock_state();
        match state.state {
            StreamState::Open => {}
            StreamState::ErroredClosed => return Err(self.stream_error(&state)),
            StreamState::Closed => {
                return Err(io::Error::other(format!(
                    "stream on '{}' is closed",
                    self.path.display()
                )))
            }
        }

        // Invariant: Open implies the writer handle is present.
        let Some(file) = state.file.as_mut() else {
            return Err(io::Error::other("writer handle missing on open stream"));
        };

        if let Err(err) = file.write_all(buf).and_then(|()| file.flush()) {
            tracing::error!("append to '{}' failed: {}", self.path.display(), err);
            state.state = StreamState::ErroredClosed;
            state.error = Some(err.to_string());
            state.file = None;
            self.frontier.notify_all();
            return Err(err);
        }

        state.written += buf.len() as u64;
        self.frontier.notify_all();
        Ok(buf.len())
    }

    /// Closes the stream, freezing the frontier. Idempotent.
    ///
    /// Parked readers wake and observe end-of-stream. A final flush
    /// failure demotes the stream to [`StreamState::ErroredClosed`].
    pub fn close(&self) {
        let mut state = self.lock_state();
        if state.state != StreamState::Open {
            return;
        }

        if let Some(mut file) = state.file.take() {
            if let Err(err) = file.flush() {
                tracing::error!("final flush of '{}' failed: {}", self.path.display(), err);
                state.state = StreamState::ErroredClosed;
                state.error = Some(err.to_string());
                self.frontier.notify_all();
                return;
            }
        }

        state.state = StreamState::Closed;
        tracing::debug!(
            "closed joinable stream on '{}' at {} bytes",
            self.path.display(),
            state.written
        );
        self.frontier.notify_all();
    }

    /// Opens an independent reader cursor at `start`.
    ///
    /// `start` must not exceed the published frontier.
    pub fn open_reader(self: &Arc<Self>, start: u64) -> io::Result<JoinableReader> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut state = self.lock_state();
        if start > state.written {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "reader offset {} is past the written frontier {}",
                    start, state.written
                ),
            ));
        }
        state.readers += 1;
        drop(state);

        Ok(JoinableReader {
            shared: Arc::clone(self),
            file,
            cursor: start,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, JoinState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stream_error(&self, state: &JoinState) -> io::Error {
        io::Error::other(format!(
            "stream on '{}' failed: {}",
            self.path.display(),
            state.error.as_deref().unwrap_or("unknown I/O failure")
        ))
    }
}

impl std::fmt::Debug for JoinableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("JoinableFile")
            .field("path", &self.path)
            .field("written", &state.written)
            .field("state", &state.state)
            .field("readers", &state.readers)
            .finish()
    }
}

/// Write half of a [`JoinableFile`], handed to the admitted writer.
pub struct JoinableWriter {
    shared: Arc<JoinableFile>,
}

impl JoinableWriter {
    pub(crate) fn new(shared: Arc<JoinableFile>) -> Self {
        JoinableWriter { shared }
    }

    /// The shared stream this writer feeds.
    pub fn stream(&self) -> &Arc<JoinableFile> {
        &self.shared
    }

    /// Closes the stream. Idempotent; also invoked when the surrounding
    /// handle is dropped.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Write for JoinableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Appends flush before publishing; nothing is buffered here.
        Ok(())
    }
}

/// An independent reader cursor over a [`JoinableFile`].
///
/// Reads block while the cursor sits at the frontier of an open stream,
/// return `Ok(0)` (end-of-stream) once the writer has closed and the
/// cursor has drained, and fail once the stream is errored.
#[derive(Debug)]
pub struct JoinableReader {
    shared: Arc<JoinableFile>,
    file: File,
    cursor: u64,
}

impl JoinableReader {
    /// Current cursor offset. Monotone, bounded by the frontier.
    pub fn position(&self) -> u64 {
        self.cursor
    }
}

impl Read for JoinableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let available = {
            let mut state = self.shared.lock_state();
            loop {
                if self.cursor < state.written {
                    break state.written - self.cursor;
                }
                match state.state {
                    StreamState::Open => {
                        state = match self.shared.frontier.wait(state) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                    StreamState::Closed => return Ok(0),
                    StreamState::ErroredClosed => {
                        return Err(self.shared.stream_error(&state))
                    }
                }
            }
        };

        let want = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
        let read = self.file.read(&mut buf[..want])?;
        if read == 0 {
            // The frontier says bytes exist that the file no longer has.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "'{}' truncated under a joined reader at offset {}",
                    self.shared.path.display(),
                    self.cursor
                ),
            ));
        }
        self.cursor += read as u64;
        Ok(read)
    }
}

impl Drop for JoinableReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        state.readers = state.readers.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn temp_stream() -> (tempfile::TempDir, Arc<JoinableFile>) {
        let dir = tempfile::tempdir().unwrap();
        let stream = Arc::new(JoinableFile::create(&dir.path().join("data.bin")).unwrap());
        (dir, stream)
    }

    #[test]
    fn test_append_advances_frontier() {
        let (_dir, stream) = temp_stream();
        assert_eq!(stream.written(), 0);
        stream.append(b"hello").unwrap();
        assert_eq!(stream.written(), 5);
        stream.append(b" world").unwrap();
        assert_eq!(stream.written(), 11);
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[test]
    fn test_reader_drains_then_sees_eof_after_close() {
        let (_dir, stream) = temp_stream();
        stream.append(b"abcdef").unwrap();

        let mut reader = stream.open_reader(0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        stream.close();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ef");
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn test_reader_at_offset() {
        let (_dir, stream) = temp_stream();
        stream.append(b"0123456789").unwrap();
        stream.close();

        let mut reader = stream.open_reader(4).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"456789");
    }

    #[test]
    fn test_reader_offset_past_frontier_rejected() {
        let (_dir, stream) = temp_stream();
        stream.append(b"abc").unwrap();
        let err = stream.open_reader(4).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_append_after_close_fails() {
        let (_dir, stream) = temp_stream();
        stream.append(b"abc").unwrap();
        stream.close();
        assert!(stream.append(b"def").is_err());
        assert_eq!(stream.written(), 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, stream) = temp_stream();
        stream.close();
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_reader_count_tracks_joins_and_drops() {
        let (_dir, stream) = temp_stream();
        assert_eq!(stream.reader_count(), 0);
        let first = stream.open_reader(0).unwrap();
        let second = stream.open_reader(0).unwrap();
        assert_eq!(stream.reader_count(), 2);
        drop(first);
        assert_eq!(stream.reader_count(), 1);
        drop(second);
        assert_eq!(stream.reader_count(), 0);
    }

    #[test]
    fn test_reader_tails_live_writer() {
        let (_dir, stream) = temp_stream();
        let writer_stream = Arc::clone(&stream);

        let writer = thread::spawn(move || {
            for chunk in 0..16u8 {
                writer_stream.append(&[chunk; 16]).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
            writer_stream.close();
        });

        let mut reader = stream.open_reader(0).unwrap();
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        writer.join().unwrap();

        assert_eq!(all.len(), 256);
        for (chunk, bytes) in all.chunks(16).enumerate() {
            assert!(bytes.iter().all(|&b| b == chunk as u8));
        }
    }

    #[test]
    fn test_independent_cursors() {
        let (_dir, stream) = temp_stream();
        stream.append(b"shared bytes").unwrap();
        stream.close();

        let mut first = stream.open_reader(0).unwrap();
        let mut second = stream.open_reader(0).unwrap();

        let mut buf = [0u8; 6];
        first.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"shared");
        // Dropping one cursor leaves the other untouched.
        drop(first);

        let mut all = Vec::new();
        second.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"shared bytes");
    }

    #[test]
    fn test_parked_reader_wakes_on_close() {
        let (_dir, stream) = temp_stream();
        let mut reader = stream.open_reader(0).unwrap();

        let closer = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                stream.close();
            })
        };

        let mut buf = [0u8; 8];
        // Blocks until the closer runs, then end-of-stream.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        closer.join().unwrap();
    }
}
