//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or socket I/O failure.
    Io(String),
    /// The peer connection is gone; nothing more can be sent or received.
    TransportClosed(String),
    /// A frame or payload could not be parsed.
    MalformedFrame(String),
    /// A cipher token could not be decrypted with the local key.
    Decryption(String),
    /// Key material could not be loaded or encryption failed.
    Crypto(String),
    /// The remote handler answered with a plaintext error response.
    Remote(String),
    /// The requested RPC method is not part of the team protocol.
    UnknownMethod(String),
    /// RPC parameters did not match the method's schema.
    InvalidParams(String),
    /// A local request handler failed.
    Handler(String),
    /// Ledger or attachment documents could not be written or read.
    Persistence(String),
    /// An explicitly bounded request did not complete in time.
    Timeout(String),
    /// An explicitly cancellable request was cancelled by the caller.
    Cancelled(String),
    /// The operation needs a joined team.
    NotJoined(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            Self::Decryption(msg) => write!(f, "decryption: {msg}"),
            Self::Crypto(msg) => write!(f, "crypto: {msg}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::UnknownMethod(method) => write!(f, "unknown rpc method {method}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Self::Handler(msg) => write!(f, "handler: {msg}"),
            Self::Persistence(msg) => write!(f, "persistence: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::NotJoined(msg) => write!(f, "not joined: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
