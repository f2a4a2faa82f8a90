//! Host key verification
//!
//! `KnownHosts` is strict: unknown hosts and changed keys are both
//! rejected. Use `AcceptAny` only against trusted test servers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::client;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Caller-supplied host key check: `(host, port, key) -> accept`
#[derive(Clone)]
pub struct HostKeyVerifier(Arc<dyn Fn(&str, u16, &PublicKey) -> bool + Send + Sync>);

impl HostKeyVerifier {
    pub fn new(f: impl Fn(&str, u16, &PublicKey) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        (self.0)(host, port, key)
    }
}

impl fmt::Debug for HostKeyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostKeyVerifier(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept every server key
    AcceptAny,

    /// Check against a known_hosts file, `~/.ssh/known_hosts` when unset
    KnownHosts {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Caller-supplied check. Serializes as `{"mode":"custom"}` and cannot
    /// be deserialized.
    #[serde(serialize_with = "serialize_custom", skip_deserializing)]
    Custom(HostKeyVerifier),
}

fn serialize_custom<S: Serializer>(_: &HostKeyVerifier, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_unit()
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self::KnownHosts { path: None }
    }
}

/// Result of a known_hosts lookup
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    Unknown,
    Changed { expected_fingerprint: String },
}

impl HostKeyPolicy {
    /// `Ok(())` accepts the key, `Err(reason)` rejects it.
    pub fn evaluate(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), String> {
        let fp = fingerprint(key);

        match self {
            Self::AcceptAny => {
                debug!("Accepting host key for {}:{} ({})", host, port, fp);
                Ok(())
            }
            Self::Custom(verifier) => {
                if verifier.verify(host, port, key) {
                    Ok(())
                } else {
                    Err(format!("host key {} rejected by verifier", fp))
                }
            }
            Self::KnownHosts { path } => {
                let path = known_hosts_path(path.as_deref());
                let contents = match std::fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Failed to read known_hosts {:?}: {}", path, e);
                        String::new()
                    }
                };

                let key_b64 = BASE64.encode(key.public_key_bytes());
                match verify_known_host(&contents, host, port, key.algorithm().as_str(), &key_b64) {
                    HostKeyVerification::Verified => {
                        info!("Host key verified for {}:{}", host, port);
                        Ok(())
                    }
                    HostKeyVerification::Unknown => Err(format!(
                        "{}:{} is not in {} (fingerprint: {})",
                        host,
                        port,
                        path.display(),
                        fp
                    )),
                    HostKeyVerification::Changed {
                        expected_fingerprint,
                    } => {
                        warn!(
                            "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                            host, port, expected_fingerprint, fp
                        );
                        Err(format!(
                            "host key for {}:{} changed (expected {}, got {})",
                            host, port, expected_fingerprint, fp
                        ))
                    }
                }
            }
        }
    }
}

fn known_hosts_path(configured: Option<&str>) -> PathBuf {
    match configured {
        Some(p) => crate::auth::expand_tilde(std::path::Path::new(p)),
        None => dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts")),
    }
}

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Look `host:port` up in known_hosts text.
///
/// Hashed entries (`|1|...`) and markers (`@revoked`, `@cert-authority`)
/// are skipped. A host with entries for other key types only is Unknown.
pub fn verify_known_host(
    contents: &str,
    host: &str,
    port: u16,
    key_type: &str,
    key_b64: &str,
) -> HostKeyVerification {
    let wanted = host_pattern(host, port);
    let mut changed = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(entry_type), Some(entry_key)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        let matches_host = hosts
            .split(',')
            .filter(|h| !h.starts_with('|'))
            .any(|h| h.eq_ignore_ascii_case(&wanted));
        if !matches_host || entry_type != key_type {
            continue;
        }

        if entry_key == key_b64 {
            return HostKeyVerification::Verified;
        }

        let expected = BASE64
            .decode(entry_key)
            .map(|b| fingerprint_bytes(&b))
            .unwrap_or_else(|_| "unknown".to_string());
        changed.get_or_insert(expected);
    }

    match changed {
        Some(expected_fingerprint) => HostKeyVerification::Changed {
            expected_fingerprint,
        },
        None => HostKeyVerification::Unknown,
    }
}

fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_lowercase()
    } else {
        format!("[{}]:{}", host.to_lowercase(), port)
    }
}

/// russh callback handler
///
/// Records the rejection reason so the connector can report
/// `HostKeyRejected` instead of a generic handshake failure.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    rejection: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> (Self, Arc<Mutex<Option<String>>>) {
        let rejection = Arc::new(Mutex::new(None));
        (
            Self {
                host,
                port,
                policy,
                rejection: rejection.clone(),
            },
            rejection,
        )
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy.evaluate(&self.host, self.port, server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                warn!("Rejecting host key for {}:{}: {}", self.host, self.port, reason);
                *self.rejection.lock() = Some(reason);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN_HOSTS: &str = "\
# comment line
sftp.example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKEY1
[sftp.example.com]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKEY2
other.example.com,10.0.0.5 ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQKEY3
|1|hashedsalt=|hashedhost= ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKEY4
";

    #[test]
    fn test_verified_default_port() {
        let result = verify_known_host(
            KNOWN_HOSTS,
            "SFTP.example.com",
            22,
            "ssh-ed25519",
            "AAAAC3NzaC1lZDI1NTE5AAAAIKEY1",
        );
        assert_eq!(result, HostKeyVerification::Verified);
    }

    #[test]
    fn test_verified_custom_port() {
        let result = verify_known_host(
            KNOWN_HOSTS,
            "sftp.example.com",
            2222,
            "ssh-ed25519",
            "AAAAC3NzaC1lZDI1NTE5AAAAIKEY2",
        );
        assert_eq!(result, HostKeyVerification::Verified);
    }

    #[test]
    fn test_changed_key() {
        let result = verify_known_host(
            KNOWN_HOSTS,
            "sftp.example.com",
            22,
            "ssh-ed25519",
            "AAAAC3NzaC1lZDI1NTE5AAAAIOTHER",
        );
        assert!(matches!(result, HostKeyVerification::Changed { .. }));
    }

    #[test]
    fn test_alias_and_unknown() {
        let result = verify_known_host(
            KNOWN_HOSTS,
            "10.0.0.5",
            22,
            "ssh-rsa",
            "AAAAB3NzaC1yc2EAAAADAQABAAABAQKEY3",
        );
        assert_eq!(result, HostKeyVerification::Verified);

        let result = verify_known_host(KNOWN_HOSTS, "new.example.com", 22, "ssh-ed25519", "AAAA");
        assert_eq!(result, HostKeyVerification::Unknown);
    }

    #[test]
    fn test_other_key_type_is_unknown() {
        let result = verify_known_host(KNOWN_HOSTS, "sftp.example.com", 22, "ssh-rsa", "AAAA");
        assert_eq!(result, HostKeyVerification::Unknown);
    }

    #[test]
    fn test_policy_serde() {
        let policy: HostKeyPolicy = serde_json::from_str(r#"{"mode":"accept_any"}"#).unwrap();
        assert!(matches!(policy, HostKeyPolicy::AcceptAny));

        let policy: HostKeyPolicy =
            serde_json::from_str(r#"{"mode":"known_hosts","path":"/tmp/kh"}"#).unwrap();
        assert!(matches!(policy, HostKeyPolicy::KnownHosts { path: Some(p) } if p == "/tmp/kh"));

        assert!(matches!(
            HostKeyPolicy::default(),
            HostKeyPolicy::KnownHosts { path: None }
        ));
    }

    #[test]
    fn test_custom_policy_serializes_as_marker() {
        let policy = HostKeyPolicy::Custom(HostKeyVerifier::new(|_, _, _| true));
        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(value, serde_json::json!({ "mode": "custom" }));

        assert!(serde_json::from_str::<HostKeyPolicy>(r#"{"mode":"custom"}"#).is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_bytes(b"key material");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
