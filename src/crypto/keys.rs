//! Network key resolution.
//!
//! An explicit key (config or `AGENT_HUDDLE_KEY`) wins; otherwise the key is
//! read from `<root>/secrets/agent-network.key`, which is created with a
//! random key on first use.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::cipher::NetworkCipher;
use crate::config::TeamConfig;
use crate::{AppError, Result};

/// File name of the generated key inside the secrets directory.
pub const KEY_FILE_NAME: &str = "agent-network.key";

/// Resolve the cipher for `config`.
///
/// # Errors
///
/// Returns [`AppError::Crypto`] for an invalid key and [`AppError::Io`] if
/// the key file cannot be read or created.
pub fn load_cipher(config: &TeamConfig) -> Result<NetworkCipher> {
    if let Some(ref key) = config.network_key {
        return NetworkCipher::from_base64(key);
    }
    load_or_create_key_file(&config.secrets_dir())
}

/// Read the key file under `secrets_dir`, generating it when absent.
///
/// # Errors
///
/// Returns [`AppError::Io`] on file-system failure and
/// [`AppError::Crypto`] if an existing file holds an invalid key.
pub fn load_or_create_key_file(secrets_dir: &Path) -> Result<NetworkCipher> {
    let path = secrets_dir.join(KEY_FILE_NAME);
    if path.exists() {
        return read_key_file(&path);
    }

    fs::create_dir_all(secrets_dir).map_err(|err| {
        AppError::Io(format!(
            "failed to create secrets directory {}: {err}",
            secrets_dir.display()
        ))
    })?;
    let key = NetworkCipher::generate_key();
    // Staged files are created owner-only; the first writer wins the rename.
    let mut staged = NamedTempFile::new_in(secrets_dir).map_err(|err| {
        AppError::Io(format!("failed to stage key file {}: {err}", path.display()))
    })?;
    staged
        .write_all(NetworkCipher::encode_key(&key).as_bytes())
        .map_err(|err| {
            AppError::Io(format!("failed to write key file {}: {err}", path.display()))
        })?;
    match staged.persist_noclobber(&path) {
        Ok(_) => {
            info!(path = %path.display(), "generated network key");
            Ok(NetworkCipher::new(&key))
        }
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "key file created concurrently, using it");
            read_key_file(&path)
        }
        Err(err) => Err(AppError::Io(format!(
            "failed to create key file {}: {}",
            path.display(),
            err.error
        ))),
    }
}

fn read_key_file(path: &Path) -> Result<NetworkCipher> {
    let encoded = fs::read_to_string(path).map_err(|err| {
        AppError::Io(format!("failed to read key file {}: {err}", path.display()))
    })?;
    NetworkCipher::from_base64(&encoded)
}
