//! Unit tests for network key resolution.

use agent_huddle::crypto::keys::{load_cipher, load_or_create_key_file, KEY_FILE_NAME};
use agent_huddle::crypto::{Cipher, NetworkCipher};
use agent_huddle::{AppError, TeamConfig};

/// The first call writes a key file; the second reads the same key back.
#[test]
fn key_file_is_created_once_and_reused() {
    let temp = tempfile::tempdir().unwrap();
    let secrets = temp.path().join("secrets");

    let first = load_or_create_key_file(&secrets).unwrap();
    assert!(secrets.join(KEY_FILE_NAME).exists());
    let contents = std::fs::read_to_string(secrets.join(KEY_FILE_NAME)).unwrap();

    let second = load_or_create_key_file(&secrets).unwrap();
    let token = first.encrypt(b"shared").unwrap();

    assert_eq!(second.decrypt(&token).unwrap(), b"shared");
    assert_eq!(
        std::fs::read_to_string(secrets.join(KEY_FILE_NAME)).unwrap(),
        contents,
        "an existing key file must not be rewritten"
    );
}

/// An explicit key wins over the key file and never touches disk.
#[test]
fn explicit_key_takes_precedence() {
    let temp = tempfile::tempdir().unwrap();
    let key = NetworkCipher::generate_key();
    let mut config = TeamConfig::new(temp.path());
    config.network_key = Some(NetworkCipher::encode_key(&key));

    let cipher = load_cipher(&config).unwrap();
    let token = NetworkCipher::new(&key).encrypt(b"x").unwrap();

    assert_eq!(cipher.decrypt(&token).unwrap(), b"x");
    assert!(!config.secrets_dir().join(KEY_FILE_NAME).exists());
}

/// Nodes sharing a root share a key.
#[test]
fn shared_root_yields_interoperable_ciphers() {
    let temp = tempfile::tempdir().unwrap();
    let config = TeamConfig::new(temp.path());

    let a = load_cipher(&config).unwrap();
    let b = load_cipher(&config).unwrap();

    assert_eq!(b.decrypt(&a.encrypt(b"team").unwrap()).unwrap(), b"team");
}

/// A corrupt key file is reported, not replaced.
#[test]
fn corrupt_key_file_is_crypto_error() {
    let temp = tempfile::tempdir().unwrap();
    let secrets = temp.path().join("secrets");
    std::fs::create_dir_all(&secrets).unwrap();
    std::fs::write(secrets.join(KEY_FILE_NAME), "c2hvcnQ=").unwrap();

    let err = load_or_create_key_file(&secrets).unwrap_err();

    assert!(matches!(err, AppError::Crypto(_)));
}

/// Concurrent first use on one root settles on a single key.
#[test]
fn concurrent_creation_agrees_on_one_key() {
    let temp = tempfile::tempdir().unwrap();
    let secrets = temp.path().join("secrets");

    let ciphers: Vec<NetworkCipher> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| load_or_create_key_file(&secrets).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let on_disk = load_or_create_key_file(&secrets).unwrap();
    for cipher in &ciphers {
        let token = cipher.encrypt(b"team").unwrap();
        assert_eq!(on_disk.decrypt(&token).unwrap(), b"team");
    }
    let leftovers = std::fs::read_dir(&secrets).unwrap().count();
    assert_eq!(leftovers, 1, "staged files must not be left behind");
}

/// The generated key file is readable by its owner only.
#[cfg(unix)]
#[test]
fn key_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().unwrap();
    let secrets = temp.path().join("secrets");
    load_or_create_key_file(&secrets).unwrap();

    let mode = std::fs::metadata(secrets.join(KEY_FILE_NAME))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o077, 0, "mode {mode:o}");
}
