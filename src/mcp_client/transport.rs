//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests and notifications to stdin
//! - A background reader that frames stdout into JSON objects and routes
//!   responses to their waiting callers by `id`
//!
//! Any number of requests may be in flight at once. Each caller owns a
//! oneshot receiver registered in the pending map; responses can arrive in
//! any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::framer::framed_messages;
use super::types::{error_codes, IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Map ─────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pending entry when the waiting request future goes away,
/// whether it completed, timed out, or was dropped by its caller.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Arc<Mutex<BoxedWriter>>,
    pending: PendingMap,
    closed: CancellationToken,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport over a writer (server stdin) and reader (server stdout).
    ///
    /// Spawns the reader task, so this must be called inside a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let writer: Arc<Mutex<BoxedWriter>> = Arc::new(Mutex::new(Box::new(writer)));
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&writer),
            Arc::clone(&pending),
            closed.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            writer,
            pending,
            closed,
            reader_task,
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Has no timeout of its own; see [`StdioTransport::request_with_timeout`].
    /// Dropping the returned future abandons the request and frees its slot.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();

        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        // The reader cancels the token before clearing the map, so an entry
        // inserted after close is caught here instead of waiting forever.
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }

        let req = JsonRpcRequest::new(id, method, params);
        write_line(&self.writer, &self.server_name, &req).await?;

        tracing::trace!(server = %self.server_name, id, method, "request sent");

        rx.await.map_err(|_| self.closed_error())
    }

    /// Like [`StdioTransport::request`], bounded by `timeout`.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        tokio::time::timeout(timeout, self.request(method, params))
            .await
            .map_err(|_| McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        let notification = JsonRpcNotification::new(method, params);
        write_line(&self.writer, &self.server_name, &notification).await
    }

    /// Close the server's stdin, asking it to exit.
    pub async fn close_input(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(server = %self.server_name, error = %e, "failed to close stdin");
        }
    }

    /// Resolves once the server's stdout has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── I/O ─────────────────────────────────────────────────────────────────────

async fn write_line<T: serde::Serialize>(
    writer: &Mutex<BoxedWriter>,
    server: &str,
    message: &T,
) -> Result<(), McpError> {
    let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');

    let mut writer = writer.lock().await;
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("failed to write to stdin: {e}"),
        })?;
    writer.flush().await.map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to flush stdin: {e}"),
    })
}

/// Route framed stdout messages until EOF, then fail every waiter.
async fn read_loop<R>(
    server: String,
    reader: R,
    writer: Arc<Mutex<BoxedWriter>>,
    pending: PendingMap,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut messages = std::pin::pin!(framed_messages(reader));

    while let Some(value) = messages.next().await {
        match IncomingMessage::classify(value) {
            IncomingMessage::Response(resp) => {
                let waiter = lock_pending(&pending).remove(&resp.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        tracing::debug!(
                            server = %server,
                            id = resp.id,
                            "response for unknown or abandoned request"
                        );
                    }
                }
            }
            IncomingMessage::Notification { method } => {
                tracing::debug!(server = %server, method = %method, "server notification");
            }
            IncomingMessage::Request { id, method } => {
                tracing::debug!(server = %server, method = %method, "rejecting server request");
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("client does not support '{method}'"),
                    },
                });
                if let Err(e) = write_line(&writer, &server, &reply).await {
                    tracing::debug!(server = %server, error = %e, "failed to reject server request");
                }
            }
            IncomingMessage::Other(value) => {
                tracing::trace!(server = %server, message = %value, "ignoring non JSON-RPC output");
            }
        }
    }

    tracing::info!(server = %server, "server stdout closed");
    closed.cancel();
    lock_pending(&pending).clear();
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
