//! Spawns a child attached to a freshly allocated pseudo-terminal.
//!
//! Mandatory (not plain pipes) for CLIs that refuse to run unless stdin is
//! a TTY. The master side is read on a blocking task (the `portable-pty`
//! reader is a plain `std::io::Read`, not tokio-async) and forwarded over
//! an mpsc channel; writes go through a `spawn_blocking` hop for the same
//! reason, matching the pattern used for PTY-driven CLI sessions elsewhere
//! in this codebase.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to allocate pty: {0}")]
    Allocate(#[source] anyhow::Error),
    #[error("failed to spawn child in pty: {0}")]
    Spawn(#[source] anyhow::Error),
    #[error("write to pty master failed: {0}")]
    Write(#[source] std::io::Error),
}

/// A single `dataRead(bytes)` event, or the terminal `processExited(code)`
/// event. `close()` guarantees the latter is emitted exactly once.
#[derive(Debug)]
pub enum PtyEvent {
    DataRead(Vec<u8>),
    ProcessExited(Option<i32>),
}

pub struct PtySession {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    _master: Mutex<Box<dyn MasterPty + Send>>,
    reader_task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<PtyEvent>,
    exited_emitted: Arc<AtomicBool>,
    closed: bool,
}

impl PtySession {
    /// Allocate a PTY and spawn `program` with `args` attached to its
    /// slave side. Returns the session plus an event receiver; a spawn
    /// failure at any step returns `Err` with no half-open state left
    /// behind (the pty pair and any partially-started child are dropped).
    pub fn start(program: &str, args: &[&str]) -> Result<(Self, mpsc::UnboundedReceiver<PtyEvent>), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Allocate)?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::Spawn)?;
        drop(pair.slave);

        let writer = pair.master.take_writer().map_err(PtyError::Allocate)?;
        let mut reader = pair.master.try_clone_reader().map_err(PtyError::Allocate)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_tx = tx.clone();
        let exited_emitted = Arc::new(AtomicBool::new(false));
        let reader_exited_emitted = exited_emitted.clone();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        emit_exited_once(&reader_tx, &reader_exited_emitted, None);
                        break;
                    }
                    Ok(n) => {
                        if reader_tx.send(PtyEvent::DataRead(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                    }
                    Err(_) => {
                        emit_exited_once(&reader_tx, &reader_exited_emitted, None);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                _master: Mutex::new(pair.master),
                reader_task: Some(reader_task),
                events: tx,
                exited_emitted,
                closed: false,
            },
            rx,
        ))
    }

    /// Deliver bytes to the master synchronously.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock().expect("pty writer mutex poisoned");
        writer.write_all(bytes).map_err(PtyError::Write)?;
        writer.flush().map_err(PtyError::Write)
    }

    /// Send SIGTERM, reap the child, and release the reader task. Safe to
    /// call more than once; only the first call does anything. Emits
    /// `PtyEvent::ProcessExited` unless the reader loop already emitted it
    /// off a natural EOF, so the event fires exactly once either way.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let child = self.child.clone();
        let exit_code = tokio::task::spawn_blocking(move || {
            let mut child = child.lock().expect("pty child mutex poisoned");
            let _ = child.kill();
            child.wait().ok().map(|status| status.exit_code() as i32)
        })
        .await
        .unwrap_or(None);

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        emit_exited_once(&self.events, &self.exited_emitted, exit_code);
    }
}

/// Sends `ProcessExited` through `tx` unless some other caller has already
/// done so, guarded by `emitted` so the reader loop and `close()` can race
/// without both delivering the event.
fn emit_exited_once(tx: &mpsc::UnboundedSender<PtyEvent>, emitted: &AtomicBool, code: Option<i32>) {
    if emitted.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = tx.send(PtyEvent::ProcessExited(code));
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Strip ANSI escape sequences (CSI and simple `ESC letter` forms) from a
/// byte chunk decoded as UTF-8 lossily. Shared by ClaudeProvider's output
/// scraping.
pub fn strip_ansi(input: &str) -> String {
    static ANSI: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"\x1b(\[[0-9;?]*[a-zA-Z]|\][^\x07]*\x07|[@-Z\\-_])").unwrap()
    });
    ANSI.replace_all(input, "").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_csi_color_codes() {
        let input = "\x1b[31mCurrent session\x1b[0m   42% used";
        assert_eq!(strip_ansi(input), "Current session   42% used");
    }

    #[test]
    fn strip_ansi_leaves_plain_text_untouched() {
        let input = "no escapes here";
        assert_eq!(strip_ansi(input), input);
    }

    #[tokio::test]
    async fn start_spawns_and_reads_child_output() {
        let (session, mut events) = PtySession::start("echo", &["hello-from-pty"]).expect("spawn echo");

        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::DataRead(bytes) => collected.extend(bytes),
                PtyEvent::ProcessExited(_) => break,
            }
        }

        drop(session);
        assert!(String::from_utf8_lossy(&collected).contains("hello-from-pty"));
    }

    #[tokio::test]
    async fn close_emits_process_exited_exactly_once() {
        let (mut session, mut events) = PtySession::start("sleep", &["30"]).expect("spawn sleep");

        session.close().await;

        let mut exited_count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PtyEvent::ProcessExited(_)) {
                exited_count += 1;
            }
        }
        assert_eq!(exited_count, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut session, _events) = PtySession::start("sleep", &["30"]).expect("spawn sleep");
        session.close().await;
        session.close().await;
    }

    #[tokio::test]
    async fn natural_exit_still_emits_process_exited_once_after_close() {
        let (mut session, mut events) = PtySession::start("true", &[]).expect("spawn true");

        // Drain until the reader loop's own EOF-triggered ProcessExited.
        let mut saw_exit = false;
        while let Some(event) = events.recv().await {
            if matches!(event, PtyEvent::ProcessExited(_)) {
                saw_exit = true;
                break;
            }
        }
        assert!(saw_exit);

        // A subsequent close() must not emit a second ProcessExited.
        session.close().await;
        assert!(events.try_recv().is_err());
    }
}
