//! Framed newline-delimited JSON-RPC transport over a child process's stdio.
//!
//! One JSON object per line, UTF-8, `\n`-terminated. Outgoing requests get a
//! monotonically increasing integer id starting at 1; responses are
//! correlated by that id. Notifications received from the peer (they carry
//! `method` but no `id`) are logged and dropped — this channel only drives
//! CodexProvider's request/response handshake, it never needs to react to
//! server-initiated notifications.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("child's stdio could not be captured")]
    MissingStdio,
    #[error("write to child stdin failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("channel closed before a response arrived")]
    ChannelClosed,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response payload")]
    MalformedResponse,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>>>;

/// Owns a spawned child and the reader/writer tasks shuttling JSON lines
/// across its stdio. Dropping the channel kills the child and aborts both
/// tasks — there is no detached-background-process failure mode.
pub struct JsonRpcChannel {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
    reader_task: Option<JoinHandle<()>>,
}

impl JsonRpcChannel {
    /// Spawn `program` with `args`, stdio fully piped, and start the
    /// reader task that demultiplexes response lines onto pending
    /// one-shot channels.
    pub async fn spawn(program: &str, args: &[&str]) -> Result<Self, JsonRpcError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(JsonRpcError::Spawn)?;

        let stdin = child.stdin.take().ok_or(JsonRpcError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(JsonRpcError::MissingStdio)?;
        let stderr = child.stderr.take().ok_or(JsonRpcError::MissingStdio)?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(reader_loop(stdout, pending.clone()));
        tokio::spawn(drain_stderr(stderr));

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            reader_task: Some(reader_task),
        })
    }

    /// Send a request and await its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.pending.lock().await;
            guard.insert(id, tx);
        }

        if let Err(err) = self.write_line(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(JsonRpcError::ChannelClosed),
        }
    }

    /// Send a notification (no `id`, no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), JsonRpcError> {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_line(&message).await
    }

    async fn write_line(&self, message: &Value) -> Result<(), JsonRpcError> {
        let mut serialized = serde_json::to_string(message).map_err(|_| JsonRpcError::MalformedResponse)?;
        serialized.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(serialized.as_bytes())
            .await
            .map_err(JsonRpcError::Write)?;
        stdin.flush().await.map_err(JsonRpcError::Write)
    }

    /// Terminate the child and reap it. Safe to call more than once.
    pub async fn terminate(&self) {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

impl Drop for JsonRpcChannel {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

async fn reader_loop(stdout: tokio::process::ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => handle_message(value, &pending).await,
                    Err(err) => {
                        tracing::warn!(line = %trimmed, error = %err, "discarding malformed json-rpc line");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "json-rpc stdout read failed");
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(line = %line, "child stderr");
    }
}

async fn handle_message(value: Value, pending: &Pending) {
    let Some(obj) = value.as_object() else {
        return;
    };

    let Some(id) = obj.get("id").and_then(Value::as_u64) else {
        // Notification from the peer: framing-level no-op per the contract.
        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            tracing::debug!(method, "ignoring inbound notification");
        }
        return;
    };

    let Some(sender) = pending.lock().await.remove(&id) else {
        return;
    };

    if let Some(error) = obj.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown rpc error")
            .to_string();
        let _ = sender.send(Err(JsonRpcError::Rpc { code, message }));
        return;
    }

    let result = obj.get("result").cloned().unwrap_or(Value::Null);
    let _ = sender.send(Ok(result));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_message_resolves_pending_result() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let message = serde_json::json!({"id": 1, "result": {"ok": true}});
        handle_message(message, &pending).await;

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn handle_message_resolves_pending_error() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(2, tx);

        let message = serde_json::json!({"id": 2, "error": {"code": -32800, "message": "cancelled"}});
        handle_message(message, &pending).await;

        let result = rx.await.unwrap();
        match result {
            Err(JsonRpcError::Rpc { code, message }) => {
                assert_eq!(code, -32800);
                assert_eq!(message, "cancelled");
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_message_ignores_notifications() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let message = serde_json::json!({"method": "progress", "params": {}});
        // Should not panic and should not touch `pending`.
        handle_message(message, &pending).await;
        assert!(pending.lock().await.is_empty());
    }
}
