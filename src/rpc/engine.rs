//! Protocol engine: listener, dialer, request correlation, and broadcast.
//!
//! Each connection gets a reader task (a [`FramedRead`] over the socket's
//! read half using [`FrameCodec`]) and a writer task draining an unbounded
//! channel into a [`FramedWrite`]. Pending requests are one `oneshot`
//! sender per outstanding id, held in a map shared by every connection of
//! the engine.
//!
//! # Failure handling
//!
//! | Condition | Behaviour |
//! |-----------|-----------|
//! | Malformed frame | logged at `WARN`, dropped, no response |
//! | Undecryptable inbound call | logged at `WARN`, dropped |
//! | Undecryptable response | the pending request fails with [`AppError::Decryption`] |
//! | Handler error | plaintext error response |
//! | Transport closed | connection removed from the registry, tasks exit |
//!
//! Nothing is retried and closed connections are never re-dialled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::FrameCodec;
use super::connection::{Connection, Direction};
use super::frame::{open_call, open_result, Frame, Inbound, ResponseBody};
use super::handler::RpcHandler;
use crate::crypto::Cipher;
use crate::{AppError, Result};

/// Thread-safe map of pending request `oneshot` senders keyed by request id.
pub type PendingRequests = Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>;

/// Number of raw frame bytes echoed into the log for a malformed frame.
const LOGGED_FRAME_PREFIX: usize = 80;

/// State shared by the engine and every connection it owns.
pub(crate) struct EngineShared {
    pub(crate) cipher: Arc<dyn Cipher>,
    pub(crate) pending: PendingRequests,
    connections: Mutex<HashMap<String, Connection>>,
}

/// Per-peer failure collected by [`ProtocolEngine::broadcast`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastFailure {
    /// Connection that could not be written to.
    pub peer_id: String,
    /// Why the send failed.
    pub error: AppError,
}

/// Running listener returned by [`ProtocolEngine::serve`].
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Listener {
    /// Address the listener is bound to (with the resolved port).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every connection accepted by this listener.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!(%err, "listener task ended abnormally");
        }
    }
}

/// Encrypted request/notification engine shared by all of a node's peers.
#[derive(Clone)]
pub struct ProtocolEngine {
    shared: Arc<EngineShared>,
}

impl ProtocolEngine {
    /// Create an engine whose payloads are sealed with `cipher`.
    #[must_use]
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                cipher,
                pending: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Bind `address` and accept peers, dispatching their calls to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the address cannot be bound.
    pub async fn serve(&self, address: &str, handler: Arc<dyn RpcHandler>) -> Result<Listener> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| AppError::Io(format!("failed to bind {address}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| AppError::Io(format!("failed to read listener address: {err}")))?;
        info!(%local_addr, "agent listener bound");

        let cancel = CancellationToken::new();
        let engine = self.clone();
        let accept_cancel = cancel.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = accept_cancel.cancelled() => {
                            info!("agent listener shutting down");
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, remote)) => {
                                    debug!(%remote, "agent peer accepted");
                                    engine
                                        .attach(
                                            stream,
                                            Direction::Inbound,
                                            Arc::clone(&handler),
                                            accept_cancel.child_token(),
                                        )
                                        .await;
                                }
                                Err(err) => {
                                    warn!(%err, "agent accept failed");
                                }
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("agent_listener", %local_addr)),
        );

        Ok(Listener {
            local_addr,
            cancel,
            handle,
        })
    }

    /// Dial `address` and dispatch calls arriving on the new connection to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] if the peer cannot be reached.
    pub async fn connect(&self, address: &str, handler: Arc<dyn RpcHandler>) -> Result<Connection> {
        let stream = TcpStream::connect(address).await.map_err(|err| {
            AppError::TransportClosed(format!("failed to connect to {address}: {err}"))
        })?;
        Ok(self
            .attach(stream, Direction::Outbound, handler, CancellationToken::new())
            .await)
    }

    /// Send the same notification to every live connection.
    ///
    /// Best effort: a failing peer is logged and reported but neither
    /// retried nor removed from the registry, and does not stop delivery
    /// to the others.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if the payload cannot be sealed.
    pub async fn broadcast(&self, method: &str, params: &Value) -> Result<Vec<BroadcastFailure>> {
        let line = Frame::notification(self.shared.cipher.as_ref(), method, params)?.to_line()?;
        let mut failures = Vec::new();
        for connection in self.connections().await {
            if let Err(error) = connection.send_line(line.clone()) {
                warn!(peer_id = connection.peer_id(), %error, method, "broadcast send failed");
                failures.push(BroadcastFailure {
                    peer_id: connection.peer_id().to_owned(),
                    error,
                });
            }
        }
        Ok(failures)
    }

    /// Snapshot of the live connection registry.
    pub async fn connections(&self) -> Vec<Connection> {
        self.shared.connections.lock().await.values().cloned().collect()
    }

    /// Look up a live connection by peer id.
    pub async fn connection(&self, peer_id: &str) -> Option<Connection> {
        self.shared.connections.lock().await.get(peer_id).cloned()
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    async fn attach(
        &self,
        stream: TcpStream,
        direction: Direction,
        handler: Arc<dyn RpcHandler>,
        closed: CancellationToken,
    ) -> Connection {
        let remote_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Connection::new(
            direction,
            remote_addr,
            outbound_tx,
            closed.clone(),
            Arc::clone(&self.shared),
        );
        let peer_id = connection.peer_id().to_owned();
        self.shared
            .connections
            .lock()
            .await
            .insert(peer_id.clone(), connection.clone());

        let span = info_span!("agent_conn", %peer_id, ?direction);
        tokio::spawn(run_writer(write_half, outbound_rx, closed).instrument(span.clone()));
        tokio::spawn(
            run_reader(Arc::clone(&self.shared), connection.clone(), read_half, handler)
                .instrument(span),
        );

        connection
    }
}

/// Writer task: drains queued lines onto the socket until closed.
async fn run_writer(
    write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    let mut framed = FramedWrite::new(write_half, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                // Flush what callers queued before closing.
                while let Ok(line) = outbound_rx.try_recv() {
                    if let Err(err) = framed.send(line).await {
                        debug!(%err, "writer: flush after close failed");
                        break;
                    }
                }
                break;
            }

            line = outbound_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                if let Err(err) = framed.send(line).await {
                    warn!(%err, "writer: socket write failed, stopping");
                    break;
                }
            }
        }
    }

    closed.cancel();
    debug!("writer stopped");
}

/// Reader task: decodes frames and routes them until the transport closes.
async fn run_reader(
    shared: Arc<EngineShared>,
    connection: Connection,
    read_half: OwnedReadHalf,
    handler: Arc<dyn RpcHandler>,
) {
    let mut framed = FramedRead::new(read_half, FrameCodec::new());
    let closed = connection.closed_token();

    loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => {
                debug!("reader: connection closed locally");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF detected");
                        break;
                    }
                    // FramedRead yields nothing after a decoder error.
                    Some(Err(AppError::MalformedFrame(ref msg))) => {
                        warn!(error = msg.as_str(), "reader: framing error, stopping");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "reader: transport error, stopping");
                        break;
                    }
                    Some(Ok(line)) => {
                        handle_line(&shared, &connection, &handler, &line).await;
                    }
                }
            }
        }
    }

    closed.cancel();
    shared.connections.lock().await.remove(connection.peer_id());
    info!("agent connection closed");
}

async fn handle_line(
    shared: &Arc<EngineShared>,
    connection: &Connection,
    handler: &Arc<dyn RpcHandler>,
    line: &str,
) {
    if line.trim().is_empty() {
        return;
    }

    let inbound = match Inbound::parse(line) {
        Ok(inbound) => inbound,
        Err(err) => {
            let raw: String = line.chars().take(LOGGED_FRAME_PREFIX).collect();
            warn!(error = %err, %raw, "invalid frame dropped");
            return;
        }
    };

    match inbound {
        Inbound::Response { id, body } => resolve_pending(shared, &id, body).await,
        Inbound::Notification { payload } => {
            let call = match open_call(shared.cipher.as_ref(), &payload) {
                Ok(call) => call,
                Err(err) => {
                    warn!(error = %err, "failed to open notification payload, dropped");
                    return;
                }
            };
            handler
                .handle_notification(call.method, call.params, connection.clone())
                .await;
        }
        Inbound::Request { id, payload } => {
            let call = match open_call(shared.cipher.as_ref(), &payload) {
                Ok(call) => call,
                Err(err) => {
                    warn!(request_id = %id, error = %err, "failed to open request payload, dropped");
                    return;
                }
            };
            let shared = Arc::clone(shared);
            let connection = connection.clone();
            let handler = Arc::clone(handler);
            tokio::spawn(
                async move {
                    let method = call.method.clone();
                    let outcome = handler
                        .handle_request(call.method, call.params, connection.clone())
                        .await;
                    let frame = match outcome {
                        Ok(value) => Frame::success(shared.cipher.as_ref(), &id, value)
                            .unwrap_or_else(|err| Frame::failure(&id, err.to_string())),
                        Err(err) => {
                            warn!(%method, error = %err, "request handler failed");
                            Frame::failure(&id, err.to_string())
                        }
                    };
                    let sent = frame.to_line().and_then(|line| connection.send_line(line));
                    if let Err(err) = sent {
                        warn!(%method, error = %err, "failed to send response");
                    }
                }
                .in_current_span(),
            );
        }
    }
}

async fn resolve_pending(shared: &EngineShared, id: &str, body: ResponseBody) {
    let Some(tx) = shared.pending.lock().await.remove(id) else {
        debug!(request_id = id, "response for unknown request id ignored");
        return;
    };

    let outcome = match body {
        ResponseBody::Error(message) => Err(AppError::Remote(message)),
        ResponseBody::Result(result) => open_result(shared.cipher.as_ref(), result).map_err(|err| {
            warn!(request_id = id, error = %err, "failed to open response result");
            err
        }),
    };

    if tx.send(outcome).is_err() {
        debug!(request_id = id, "requester stopped waiting before the response arrived");
    }
}
