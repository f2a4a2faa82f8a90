//! Authentication provider
//!
//! Two phases: [`AuthProvider::validate_credentials`] is a cheap local check
//! run at construction, [`AuthProvider::auth_methods`] does the expensive
//! part (reading and decrypting key material) right before a handshake.

mod key;

pub use key::expand_tilde;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::Error;

/// Credential material as it appears in configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },

    /// Private key file, `~` is expanded
    PrivateKeyPath {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },

    /// Private key text (OpenSSH or PEM)
    PrivateKeyBytes {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key_path(path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKeyPath {
            path: path.into(),
            passphrase,
        }
    }

    pub fn key_bytes(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKeyBytes {
            key: key.into(),
            passphrase,
        }
    }
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Password {
            password: String::new(),
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Password { .. }"),
            Self::PrivateKeyPath { path, .. } => {
                f.debug_struct("PrivateKeyPath").field("path", path).finish_non_exhaustive()
            }
            Self::PrivateKeyBytes { .. } => f.write_str("PrivateKeyBytes { .. }"),
        }
    }
}

/// Where private key material comes from
#[derive(Clone)]
pub enum KeySource {
    Path(PathBuf),
    Inline(String),
}

/// Ready-to-use credential for one authentication attempt
#[derive(Clone)]
pub enum Credential {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(..)"),
            Self::PublicKey(key) => write!(f, "PublicKey({})", key.algorithm()),
        }
    }
}

#[derive(Clone)]
pub enum AuthProvider {
    Password {
        username: String,
        password: String,
    },
    PrivateKey {
        username: String,
        source: KeySource,
        passphrase: Option<String>,
    },
}

impl AuthProvider {
    /// Build a provider from configuration and validate it.
    pub fn from_config(config: &AuthConfig) -> Result<Self, Error> {
        let config = config.clone().merged_with_defaults();
        let username = config.username.clone();

        let provider = match config.method {
            AuthMethod::Password { password } => Self::Password { username, password },
            AuthMethod::PrivateKeyPath { path, passphrase } => Self::PrivateKey {
                username,
                source: KeySource::Path(PathBuf::from(path)),
                passphrase,
            },
            AuthMethod::PrivateKeyBytes { key, passphrase } => Self::PrivateKey {
                username,
                source: KeySource::Inline(key),
                passphrase,
            },
        };

        provider.validate_credentials()?;
        Ok(provider)
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. } | Self::PrivateKey { username, .. } => username,
        }
    }

    /// Local checks only, no I/O.
    pub fn validate_credentials(&self) -> Result<(), Error> {
        if self.username().trim().is_empty() {
            return Err(Error::authentication("username is required"));
        }

        match self {
            Self::Password { password, .. } => {
                if password.is_empty() {
                    return Err(Error::authentication("password is required"));
                }
            }
            Self::PrivateKey { source, .. } => match source {
                KeySource::Path(path) => {
                    if path.as_os_str().is_empty() {
                        return Err(Error::authentication("private key path is required"));
                    }
                }
                KeySource::Inline(key) => {
                    if key.trim().is_empty() {
                        return Err(Error::authentication("private key data is required"));
                    }
                }
            },
        }

        Ok(())
    }

    /// Materialize credentials for a handshake. Reads and decrypts key files.
    pub async fn auth_methods(&self) -> Result<Vec<Credential>, Error> {
        match self {
            Self::Password { password, .. } => Ok(vec![Credential::Password(password.clone())]),
            Self::PrivateKey {
                source, passphrase, ..
            } => {
                let key = match source {
                    KeySource::Path(path) => key::load_from_path(path, passphrase.as_deref()).await?,
                    KeySource::Inline(data) => {
                        key::load_from_bytes(data, passphrase.as_deref()).await?
                    }
                };
                Ok(vec![Credential::PublicKey(Arc::new(key))])
            }
        }
    }
}

impl fmt::Debug for AuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::PrivateKey {
                username, source, ..
            } => {
                let source = match source {
                    KeySource::Path(p) => p.display().to_string(),
                    KeySource::Inline(_) => "<inline>".to_string(),
                };
                f.debug_struct("PrivateKey")
                    .field("username", username)
                    .field("source", &source)
                    .finish_non_exhaustive()
            }
        }
    }
}
