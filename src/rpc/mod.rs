//! Encrypted request/notification protocol over persistent TCP connections.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing, one JSON frame per line.
//! - `frame`: envelope construction and inbound classification.
//! - `handler`: the [`RpcHandler`] seam dispatching inbound calls.
//! - `connection`: one live peer ([`Connection`]).
//! - `engine`: [`ProtocolEngine`], which owns the pending-request map and the
//!   connection registry and runs one reader and one writer task per peer.

pub mod codec;
pub mod connection;
pub mod engine;
pub mod frame;
pub mod handler;

pub use connection::{Connection, Direction};
pub use engine::{BroadcastFailure, Listener, ProtocolEngine};
pub use handler::{HandlerFuture, RejectCalls, RpcHandler};
