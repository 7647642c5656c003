//! Stream writer
//!
//! Copies the encoder's stdout into the session's archive file. One session
//! maps to exactly one archive: the file is opened once in append mode and
//! never rotated. The copy loop runs on a dedicated OS thread so a stalled
//! pipe or slow disk only affects its own session.

use super::state::{SessionState, StateCell};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Bytes requested from the pipe per read
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Archive write failures
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("failed to open archive {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read encoder output: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write archive: {0}")]
    Write(#[source] io::Error),
}

/// Why the copy loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Pipe closed, the encoder is gone
    Eof,
    /// Stop flag observed between reads
    StopRequested,
}

#[derive(Debug)]
pub struct WriterOutcome {
    pub result: Result<WriterExit, WriterError>,
    pub bytes_written: u64,
}

/// Append-only archive handle; flushed and synced on every exit path
struct ArchiveFile {
    file: Option<File>,
}

impl ArchiveFile {
    fn open(path: &Path) -> Result<Self, WriterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WriterError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| WriterError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { file: Some(file) })
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::Other, "archive already closed")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                file.sync_data()
            }
            None => Ok(()),
        }
    }
}

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "archive close failed");
        }
    }
}

/// Copies a byte source into one archive file
pub struct StreamWriter<R> {
    source: R,
    archive_path: PathBuf,
    stop: Arc<AtomicBool>,
    bytes_written: Arc<AtomicU64>,
    state: Arc<StateCell>,
}

impl<R: Read> StreamWriter<R> {
    pub fn new(
        source: R,
        archive_path: PathBuf,
        stop: Arc<AtomicBool>,
        bytes_written: Arc<AtomicU64>,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            source,
            archive_path,
            stop,
            bytes_written,
            state,
        }
    }

    /// Run the copy loop on the current thread until EOF, stop or error.
    pub fn run(mut self) -> WriterOutcome {
        let result = self.copy_loop();

        match &result {
            Ok(WriterExit::Eof) => {
                // Encoder exited on its own; a concurrent stop() finishes the rest
                self.state.transition(SessionState::Stopped);
            }
            Ok(WriterExit::StopRequested) => {}
            Err(_) => {
                self.state.transition(SessionState::Failed);
            }
        }

        WriterOutcome {
            result,
            bytes_written: self.bytes_written.load(Ordering::SeqCst),
        }
    }

    fn copy_loop(&mut self) -> Result<WriterExit, WriterError> {
        let mut archive = ArchiveFile::open(&self.archive_path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let exit = loop {
            if self.stop.load(Ordering::SeqCst) {
                break WriterExit::StopRequested;
            }

            let n = match self.source.read(&mut buf) {
                Ok(0) => break WriterExit::Eof,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(WriterError::Read(e)),
            };

            archive.write_all(&buf[..n]).map_err(WriterError::Write)?;
            self.bytes_written.fetch_add(n as u64, Ordering::SeqCst);
        };

        archive.close().map_err(WriterError::Write)?;
        Ok(exit)
    }
}

impl<R: Read + Send + 'static> StreamWriter<R> {
    /// Start the copy loop on a named thread.
    ///
    /// Events are emitted inside `span`.
    pub fn spawn(self, thread_name: String, span: tracing::Span) -> io::Result<WriterHandle> {
        let (done_tx, done_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let _entered = span.enter();
                let archive = self.archive_path.display().to_string();
                tracing::debug!(archive = %archive, "writer started");

                let outcome = self.run();
                match &outcome.result {
                    Ok(exit) => tracing::info!(
                        archive = %archive,
                        bytes = outcome.bytes_written,
                        exit = ?exit,
                        "writer finished"
                    ),
                    Err(e) => tracing::error!(
                        archive = %archive,
                        bytes = outcome.bytes_written,
                        error = %e,
                        "writer failed"
                    ),
                }
                let _ = done_tx.send(outcome);
            })?;

        Ok(WriterHandle {
            thread: Some(thread),
            done_rx,
            outcome: None,
        })
    }
}

/// Handle to a running writer thread
pub struct WriterHandle {
    thread: Option<JoinHandle<()>>,
    done_rx: mpsc::Receiver<WriterOutcome>,
    outcome: Option<WriterOutcome>,
}

impl WriterHandle {
    /// Wait up to `timeout` for the writer to finish and join it.
    ///
    /// Returns `false` if the writer is still running when the wait expires;
    /// the thread is then left detached.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        if self.outcome.is_none() {
            match self.done_rx.recv_timeout(timeout) {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(mpsc::RecvTimeoutError::Timeout) => return false,
                // Sender dropped without a result: the thread panicked
                Err(mpsc::RecvTimeoutError::Disconnected) => {}
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("writer thread panicked");
            }
        }
        true
    }

    pub fn outcome(&self) -> Option<&WriterOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn writer_for<R: Read>(source: R, path: PathBuf) -> (StreamWriter<R>, Arc<AtomicBool>, Arc<StateCell>) {
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(StateCell::new(SessionState::Running));
        let writer = StreamWriter::new(
            source,
            path,
            stop.clone(),
            Arc::new(AtomicU64::new(0)),
            state.clone(),
        );
        (writer, stop, state)
    }

    /// Yields fixed-size chunks, then fails
    struct FailingReader {
        chunks_left: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks_left == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom"));
            }
            self.chunks_left -= 1;
            let n = buf.len().min(100);
            buf[..n].fill(7);
            Ok(n)
        }
    }

    #[test]
    fn test_copies_all_bytes_until_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alice").join("a.ts");
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();

        let (writer, _stop, state) = writer_for(Cursor::new(data.clone()), path.clone());
        let outcome = writer.run();

        assert!(matches!(outcome.result, Ok(WriterExit::Eof)));
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(state.get(), SessionState::Stopped);
    }

    #[test]
    fn test_eof_during_launch_ends_stopped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ts");
        let state = Arc::new(StateCell::new(SessionState::Starting));
        let writer = StreamWriter::new(
            Cursor::new(b"short".to_vec()),
            path.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
            state.clone(),
        );

        assert!(matches!(writer.run().result, Ok(WriterExit::Eof)));
        assert_eq!(state.get(), SessionState::Stopped);
        // launch finishing late must not revive the session
        assert_eq!(state.transition(SessionState::Running), None);
    }

    #[test]
    fn test_appends_to_existing_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ts");
        std::fs::write(&path, b"head").unwrap();

        let (writer, _stop, _state) = writer_for(Cursor::new(b"tail".to_vec()), path.clone());
        writer.run();

        assert_eq!(std::fs::read(&path).unwrap(), b"headtail");
    }

    #[test]
    fn test_stop_flag_checked_before_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ts");

        let (writer, stop, state) = writer_for(Cursor::new(vec![1u8; 10]), path.clone());
        stop.store(true, Ordering::SeqCst);
        let outcome = writer.run();

        assert!(matches!(outcome.result, Ok(WriterExit::StopRequested)));
        assert_eq!(outcome.bytes_written, 0);
        assert!(path.exists());
        assert_eq!(state.get(), SessionState::Running);
    }

    #[test]
    fn test_read_error_fails_session_and_keeps_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ts");

        let (writer, _stop, state) = writer_for(FailingReader { chunks_left: 3 }, path.clone());
        let outcome = writer.run();

        assert!(matches!(outcome.result, Err(WriterError::Read(_))));
        assert_eq!(outcome.bytes_written, 300);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 300);
        assert_eq!(state.get(), SessionState::Failed);
    }

    #[test]
    fn test_spawned_writer_joins_within_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.ts");

        let (writer, _stop, _state) = writer_for(Cursor::new(vec![9u8; 1024]), path.clone());
        let mut handle = writer
            .spawn("ts-writer-test".to_string(), tracing::Span::none())
            .unwrap();

        assert!(handle.join_timeout(Duration::from_secs(5)));
        assert!(handle.is_finished());
        assert_eq!(handle.outcome().unwrap().bytes_written, 1024);
    }
}
