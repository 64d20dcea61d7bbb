//! Dispatch seam between the protocol engine and the domain layer.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::debug;

use super::connection::Connection;
use crate::{AppError, Result};

/// Boxed future returned by [`RpcHandler`] methods.
pub type HandlerFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receives decrypted inbound calls for one or more connections.
///
/// The engine runs every request on its own task and turns the returned
/// value into a success response; an `Err` becomes a plaintext error
/// response carrying the error's `Display` text. Notifications run inline
/// on the connection's reader task, in arrival order.
pub trait RpcHandler: Send + Sync {
    /// Handle a call that expects a reply.
    fn handle_request(
        &self,
        method: String,
        params: Value,
        connection: Connection,
    ) -> HandlerFuture<'_, Result<Value>>;

    /// Handle a one-way call.
    fn handle_notification(
        &self,
        method: String,
        params: Value,
        connection: Connection,
    ) -> HandlerFuture<'_, ()>;
}

/// Handler for connections that only make outbound calls.
///
/// Requests are answered with an error naming the method; notifications
/// are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectCalls;

impl RpcHandler for RejectCalls {
    fn handle_request(
        &self,
        method: String,
        _params: Value,
        _connection: Connection,
    ) -> HandlerFuture<'_, Result<Value>> {
        Box::pin(async move { Err(AppError::UnknownMethod(method)) })
    }

    fn handle_notification(
        &self,
        method: String,
        _params: Value,
        connection: Connection,
    ) -> HandlerFuture<'_, ()> {
        Box::pin(async move {
            debug!(%method, peer_id = connection.peer_id(), "notification ignored");
        })
    }
}
