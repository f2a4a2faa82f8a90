//! Private key loading
//!
//! Handles OpenSSH and PEM private keys (Ed25519, ECDSA, RSA), encrypted or
//! not. Every failure here is an authentication error: a bad key does not
//! get better by retrying.

use std::path::{Path, PathBuf};

use russh::keys::PrivateKey;
use tracing::debug;

use crate::error::Error;

/// Load and decode a private key from disk.
pub async fn load_from_path(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, Error> {
    let path = expand_tilde(path);

    if !path.exists() {
        return Err(Error::authentication(format!(
            "Key file not found: {}",
            path.display()
        )));
    }

    debug!("Loading key from: {:?}", path);
    let key_data = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::authentication(format!("Failed to read key file {}: {}", path.display(), e))
    })?;

    decode_blocking(key_data, passphrase.map(str::to_string)).await
}

/// Decode in-memory key material.
pub async fn load_from_bytes(key_data: &str, passphrase: Option<&str>) -> Result<PrivateKey, Error> {
    decode_blocking(key_data.to_string(), passphrase.map(str::to_string)).await
}

// Encrypted keys run a KDF; keep it off the runtime threads.
async fn decode_blocking(key_data: String, passphrase: Option<String>) -> Result<PrivateKey, Error> {
    tokio::task::spawn_blocking(move || decode(&key_data, passphrase.as_deref()))
        .await
        .map_err(|e| Error::authentication(format!("Key decoding task failed: {}", e)))?
}

fn decode(key_data: &str, passphrase: Option<&str>) -> Result<PrivateKey, Error> {
    // Legacy PEM marks encryption in the header
    let pem_encrypted = key_data.contains("Proc-Type: 4,ENCRYPTED")
        || key_data.contains("BEGIN ENCRYPTED PRIVATE KEY");

    if pem_encrypted && passphrase.is_none() {
        return Err(passphrase_required());
    }

    // An empty passphrase is the same as none
    let passphrase = passphrase.filter(|p| !p.is_empty());

    russh::keys::decode_secret_key(key_data, passphrase).map_err(|e| match e {
        russh::keys::Error::KeyIsEncrypted => passphrase_required(),
        other => {
            let msg = other.to_string();
            if passphrase.is_some() && (msg.contains("decrypt") || msg.contains("password")) {
                Error::authentication("Invalid passphrase for private key")
            } else {
                Error::authentication(format!("Failed to parse private key: {}", msg))
            }
        }
    })
}

fn passphrase_required() -> Error {
    Error::authentication("Encrypted key requires passphrase")
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_KEY: &str = include_str!("../../tests/fixtures/id_ed25519");
    const ENCRYPTED_KEY: &str = include_str!("../../tests/fixtures/id_ed25519_enc");

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde(Path::new("~/.ssh/id_rsa"));
        if dirs::home_dir().is_some() {
            assert!(!path.to_string_lossy().starts_with('~'));
        }

        let absolute = expand_tilde(Path::new("/etc/ssh/key"));
        assert_eq!(absolute, PathBuf::from("/etc/ssh/key"));
    }

    #[tokio::test]
    async fn test_load_plain_key() {
        let key = load_from_bytes(PLAIN_KEY, None).await.unwrap();
        assert_eq!(key.algorithm().as_str(), "ssh-ed25519");
    }

    #[tokio::test]
    async fn test_plain_key_ignores_passphrase() {
        assert!(load_from_bytes(PLAIN_KEY, Some("unused")).await.is_ok());
    }

    #[tokio::test]
    async fn test_encrypted_key_needs_passphrase() {
        let err = load_from_bytes(ENCRYPTED_KEY, None).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(err.to_string().contains("passphrase"));
    }

    #[tokio::test]
    async fn test_encrypted_key_with_passphrase() {
        let key = load_from_bytes(ENCRYPTED_KEY, Some("correct horse")).await.unwrap();
        assert_eq!(key.algorithm().as_str(), "ssh-ed25519");
    }

    #[tokio::test]
    async fn test_garbage_is_authentication_error() {
        let err = load_from_bytes("not a key", None).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = load_from_path(Path::new("/nonexistent/oxide/id_ed25519"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, PLAIN_KEY).unwrap();

        assert!(load_from_path(&path, None).await.is_ok());
    }
}
