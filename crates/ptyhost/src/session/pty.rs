//! PTY session management.
//!
//! A [`PtySession`] owns one pseudo-terminal and the process running in it.
//! Output is decoded to UTF-8, appended to a bounded scrollback and
//! broadcast to every attached reader; the exit code is published once the
//! child has been reaped.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::{ExitCode, SessionId, SessionSpec, TransportError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use super::buffer::{Scrollback, Utf8Decoder};

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionError> for TransportError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound(id) => TransportError::not_found(id),
            SessionError::Io(e) => TransportError::from(e),
            SessionError::WriteFailed(_)
            | SessionError::ResizeFailed(_)
            | SessionError::KillFailed(_) => TransportError::Io(message),
            SessionError::AlreadyTerminated(_) | SessionError::SpawnFailed(_) => {
                TransportError::Rejected(message)
            }
        }
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for broadcast output.
const BROADCAST_CAPACITY: usize = 256;

/// How often the reaper polls the child for exit.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for trailing output after the child exits.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scrollback and broadcast sender, updated under one lock so that a new
/// reader's snapshot and its first delta never overlap or leave a gap.
struct OutputState {
    scrollback: Scrollback,
    tx: broadcast::Sender<String>,
}

/// A PTY session running one process.
pub struct PtySession {
    id: SessionId,
    master: tokio::sync::Mutex<Box<dyn MasterPty + Send>>,
    writer: tokio::sync::Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    output: Arc<Mutex<OutputState>>,
    exit_tx: Arc<watch::Sender<Option<ExitCode>>>,
    running: Arc<AtomicBool>,
    size: Mutex<(u16, u16)>,
    pid: Option<u32>,
}

impl PtySession {
    /// Spawns `spec` in a new PTY and starts capturing its output.
    ///
    /// `spec.command` falls back to `default_shell`, then `$SHELL`, then
    /// `/bin/sh`. Must be called from within a Tokio runtime.
    pub fn spawn(
        id: SessionId,
        spec: &SessionSpec,
        default_shell: Option<&str>,
        scrollback_bytes: usize,
    ) -> Result<Arc<Self>, SessionError> {
        let program = detect_shell(spec.command.as_deref().or(default_shell));

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (exit_tx, _) = watch::channel(None);

        let session = Arc::new(Self {
            id,
            master: tokio::sync::Mutex::new(pair.master),
            writer: tokio::sync::Mutex::new(writer),
            child: Arc::new(Mutex::new(child)),
            output: Arc::new(Mutex::new(OutputState {
                scrollback: Scrollback::new(scrollback_bytes),
                tx,
            })),
            exit_tx: Arc::new(exit_tx),
            running: Arc::new(AtomicBool::new(true)),
            size: Mutex::new((spec.cols, spec.rows)),
            pid,
        });

        session.start_io(reader);

        tracing::info!(
            session_id = %session.id,
            program = %program,
            pid = ?pid,
            cols = spec.cols,
            rows = spec.rows,
            "Spawned PTY session"
        );

        Ok(session)
    }

    fn start_io(&self, reader: Box<dyn Read + Send>) {
        let output = Arc::clone(&self.output);
        let session_id = self.id.clone();
        let mut reader_task =
            tokio::task::spawn_blocking(move || read_loop(reader, output, session_id));

        let child = Arc::clone(&self.child);
        let exit_tx = Arc::clone(&self.exit_tx);
        let running = Arc::clone(&self.running);
        let session_id = self.id.clone();

        tokio::spawn(async move {
            let code = reap(&child, &session_id).await;

            if tokio::time::timeout(DRAIN_GRACE, &mut reader_task).await.is_err() {
                tracing::debug!(session_id = %session_id, "PTY still open after process exit");
            }

            running.store(false, Ordering::SeqCst);
            exit_tx.send_replace(Some(code));
            tracing::info!(session_id = %session_id, exit_code = code, "Process exited");
        });
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<ExitCode> {
        *self.exit_tx.borrow()
    }

    /// Watches for the exit code.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitCode>> {
        self.exit_tx.subscribe()
    }

    /// Returns the current scrollback together with a receiver for every
    /// delta produced after it.
    pub fn attach(&self) -> (String, broadcast::Receiver<String>) {
        let output = lock(&self.output);
        (output.scrollback.snapshot(), output.tx.subscribe())
    }

    /// Returns the current scrollback.
    pub fn snapshot(&self) -> String {
        lock(&self.output).scrollback.snapshot()
    }

    /// Number of attached output receivers.
    pub fn reader_count(&self) -> usize {
        lock(&self.output).tx.receiver_count()
    }

    /// Writes input to the process.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Resizes the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *lock(&self.size) = (cols, rows);

        tracing::debug!(session_id = %self.id, cols, rows, "Resized PTY");
        Ok(())
    }

    /// Terminates the process. The exit code is published by the reaper.
    pub fn kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        lock(&self.child)
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;

        tracing::info!(session_id = %self.id, "Killed session");
        Ok(())
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = lock(&self.child).kill();
        }
    }
}

/// Reads until EOF, publishing decoded output. Runs on a blocking thread.
fn read_loop(mut reader: Box<dyn Read + Send>, output: Arc<Mutex<OutputState>>, session_id: SessionId) {
    let mut decoder = Utf8Decoder::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (text, ended) = match reader.read(&mut buffer) {
            Ok(0) => {
                tracing::debug!(session_id = %session_id, "PTY EOF");
                (decoder.finish(), true)
            }
            Ok(n) => (decoder.decode(&buffer[..n]), false),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the slave side is gone.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                (decoder.finish(), true)
            }
        };

        if !text.is_empty() {
            publish(&output, text);
        }
        if ended {
            break;
        }
    }
}

fn publish(output: &Mutex<OutputState>, text: String) {
    let mut output = lock(output);
    output.scrollback.push(&text);
    // No receivers is fine; the session may be detached.
    let _ = output.tx.send(text);
}

/// Polls the child until it exits and returns its exit code.
async fn reap(child: &Mutex<Box<dyn Child + Send + Sync>>, session_id: &str) -> ExitCode {
    loop {
        let status = lock(child).try_wait();
        match status {
            Ok(Some(status)) => return status.exit_code() as ExitCode,
            Ok(None) => tokio::time::sleep(REAP_INTERVAL).await,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to poll child process");
                return -1;
            }
        }
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if non-empty
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<&str>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s.to_string();
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
