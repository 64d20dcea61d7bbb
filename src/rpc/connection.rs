//! A single live peer connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::engine::EngineShared;
use super::frame::Frame;
use crate::{AppError, Result};

/// Metadata key holding the node id registered over this connection.
pub const NODE_ID_KEY: &str = "node_id";

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by one of our listeners.
    Inbound,
    /// Dialled by us with [`ProtocolEngine::connect`](super::ProtocolEngine::connect).
    Outbound,
}

/// How long a request is allowed to wait for its response.
enum Wait {
    Forever,
    Timeout(Duration),
    Cancel(CancellationToken),
}

/// Handle to one live socket plus its opaque peer id and metadata map.
///
/// Cheap to clone; all clones share the same socket. Sending never blocks:
/// frames are queued to the connection's writer task.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    peer_id: String,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    metadata: Mutex<HashMap<String, String>>,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    engine: Arc<EngineShared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.inner.peer_id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        direction: Direction,
        remote_addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<String>,
        closed: CancellationToken,
        engine: Arc<EngineShared>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                peer_id: Uuid::new_v4().simple().to_string(),
                direction,
                remote_addr,
                metadata: Mutex::new(HashMap::new()),
                outbound,
                closed,
                engine,
            }),
        }
    }

    /// Opaque identifier of this connection, unique per engine.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Which side opened the socket.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Remote socket address, when the OS reported one.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Read a metadata value.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<String> {
        self.lock_metadata().get(key).cloned()
    }

    /// Set a metadata value, replacing any previous one.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock_metadata().insert(key.into(), value.into());
    }

    /// Node id registered over this connection, once known.
    #[must_use]
    pub fn node_id(&self) -> Option<String> {
        self.metadata(NODE_ID_KEY)
    }

    /// Whether the connection has been closed locally or by the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.outbound.is_closed()
    }

    /// Send a request and wait for its response, with no upper bound.
    ///
    /// A peer that never answers keeps the caller suspended; use
    /// [`request_with_timeout`](Self::request_with_timeout) or
    /// [`request_with_cancel`](Self::request_with_cancel) to bound the wait.
    ///
    /// # Errors
    ///
    /// - [`AppError::TransportClosed`] if the frame cannot be queued.
    /// - [`AppError::Remote`] if the peer answered with an error response.
    /// - [`AppError::Decryption`] if the response cannot be decrypted.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.send_request(method, params, Wait::Forever).await
    }

    /// Like [`request`](Self::request) but gives up after `limit`.
    ///
    /// # Errors
    ///
    /// Everything [`request`](Self::request) returns, plus
    /// [`AppError::Timeout`] when `limit` elapses first.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value> {
        self.send_request(method, params, Wait::Timeout(limit)).await
    }

    /// Like [`request`](Self::request) but gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Everything [`request`](Self::request) returns, plus
    /// [`AppError::Cancelled`] when `cancel` fires first.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<Value> {
        self.send_request(method, params, Wait::Cancel(cancel)).await
    }

    /// Send a one-way notification.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] if the connection is gone.
    pub fn notify(&self, method: &str, params: &Value) -> Result<()> {
        let frame = Frame::notification(self.inner.engine.cipher.as_ref(), method, params)?;
        self.send_line(frame.to_line()?)
    }

    /// Close the connection. Frames already queued are still flushed.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub(crate) fn send_line(&self, line: String) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(AppError::TransportClosed(format!(
                "connection {} is closed",
                self.inner.peer_id
            )));
        }
        self.inner.outbound.send(line).map_err(|_| {
            AppError::TransportClosed(format!("connection {} writer is gone", self.inner.peer_id))
        })
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    async fn send_request(&self, method: &str, params: Value, wait: Wait) -> Result<Value> {
        let engine = &self.inner.engine;
        let request_id = Uuid::new_v4().simple().to_string();
        let frame = Frame::request(engine.cipher.as_ref(), &request_id, method, &params)?;
        let line = frame.to_line()?;

        let (tx, rx) = oneshot::channel();
        engine.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.send_line(line) {
            engine.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        debug!(peer_id = self.peer_id(), %request_id, method, "request sent");

        let outcome = match wait {
            Wait::Forever => rx.await,
            Wait::Timeout(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    engine.pending.lock().await.remove(&request_id);
                    return Err(AppError::Timeout(format!(
                        "{method} request {request_id} got no response within {limit:?}"
                    )));
                }
            }
            Wait::Cancel(cancel) => {
                tokio::select! {
                    outcome = rx => outcome,
                    () = cancel.cancelled() => {
                        engine.pending.lock().await.remove(&request_id);
                        return Err(AppError::Cancelled(format!(
                            "{method} request {request_id} cancelled"
                        )));
                    }
                }
            }
        };

        outcome.map_err(|_| {
            AppError::TransportClosed(format!("{method} request {request_id} was abandoned"))
        })?
    }

    fn lock_metadata(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
