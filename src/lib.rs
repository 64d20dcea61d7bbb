#![forbid(unsafe_code)]

//! Encrypted request/notification protocol and team coordination for
//! independent agent processes.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod rpc;
pub mod team;

pub use config::TeamConfig;
pub use errors::{AppError, Result};
