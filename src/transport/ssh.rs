//! SSH/SFTP transport using russh
//!
//! One [`SshSession`] = one SSH connection with one SFTP subsystem channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tracing::{debug, info};

use super::host_key::{ClientHandler, HostKeyPolicy};
use super::{Connector, FileType, RemoteEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteWriter};
use crate::auth::Credential;
use crate::config::{AuthConfig, ConnectionConfig};
use crate::error::{ConnectionError, Error, FsError};

/// Dials `host:port` and opens an SFTP subsystem.
#[derive(Debug, Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    dial_timeout: Duration,
    host_key: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(host: impl Into<String>, port: u16, dial_timeout: Duration, host_key: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            dial_timeout,
            host_key,
        }
    }

    pub fn from_config(auth: &AuthConfig, connection: &ConnectionConfig) -> Self {
        Self::new(
            auth.host.clone(),
            auth.port,
            connection.dial_timeout(),
            auth.host_key.clone(),
        )
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
        credentials: &[Credential],
    ) -> Result<(), Error> {
        for credential in credentials {
            let result = match credential {
                Credential::Password(password) => handle
                    .authenticate_password(username, password)
                    .await
                    .map_err(|e| ConnectionError::Handshake(e.to_string()))?,
                Credential::PublicKey(key) => {
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .map_err(|e| ConnectionError::Handshake(e.to_string()))?
                        .flatten();
                    handle
                        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
                        .await
                        .map_err(|e| ConnectionError::Handshake(e.to_string()))?
                }
            };

            if result.success() {
                return Ok(());
            }
            debug!("Credential {:?} rejected for {}", credential, username);
        }

        Err(Error::authentication(format!(
            "Authentication rejected by server for {}@{}",
            username, self.host
        )))
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    async fn connect(&self, username: &str, credentials: &[Credential]) -> Result<SshSession, Error> {
        info!("Connecting to SSH server at {}:{}", self.host, self.port);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let (handler, rejection) =
            ClientHandler::new(self.host.clone(), self.port, self.host_key.clone());

        let connected = tokio::time::timeout(
            self.dial_timeout,
            client::connect(Arc::new(ssh_config), (self.host.as_str(), self.port), handler),
        )
        .await
        .map_err(|_| {
            ConnectionError::Timeout(format!(
                "connecting to {}:{} took longer than {:?}",
                self.host, self.port, self.dial_timeout
            ))
        })?;

        let mut handle = match connected {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(reason) = rejection.lock().take() {
                    return Err(ConnectionError::HostKeyRejected(reason).into());
                }
                return Err(match e {
                    russh::Error::IO(io) => ConnectionError::Dial(io.to_string()),
                    other => ConnectionError::Handshake(other.to_string()),
                }
                .into());
            }
        };

        debug!("SSH handshake completed");

        self.authenticate(&mut handle, username, credentials).await?;
        info!("SSH authentication successful for {}", username);

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::Handshake(format!("Failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ConnectionError::Handshake(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ConnectionError::Handshake(format!("Failed to initialize SFTP: {}", e)))?;

        debug!("SFTP session established");
        Ok(SshSession {
            handle,
            sftp,
            protocol_closed: AtomicBool::new(false),
        })
    }
}

pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    sftp: SftpSession,
    protocol_closed: AtomicBool,
}

fn to_metadata(attrs: &FileAttributes) -> RemoteMetadata {
    let file_type = if attrs.is_dir() {
        FileType::Directory
    } else if attrs.is_symlink() {
        FileType::Symlink
    } else if attrs.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    RemoteMetadata {
        file_type,
        size: attrs.size.unwrap_or(0),
        mtime: attrs.mtime.map(u64::from),
        permissions: attrs.permissions,
    }
}

#[async_trait]
impl RemoteFs for SshSession {
    async fn ping(&self) -> Result<(), FsError> {
        self.sftp.canonicalize(".").await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        let attrs = self.sftp.metadata(path).await?;
        Ok(to_metadata(&attrs))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        let attrs = self.sftp.symlink_metadata(path).await?;
        Ok(to_metadata(&attrs))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError> {
        let entries = self.sftp.read_dir(path).await?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteEntry {
                name: entry.file_name(),
                metadata: to_metadata(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        self.sftp.create_dir(path).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FsError> {
        self.sftp.remove_file(path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        self.sftp.remove_dir(path).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.sftp.rename(from, to).await?;
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode);
        self.sftp.set_metadata(path, attrs).await?;
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, FsError> {
        let file = self.sftp.open(path).await?;
        Ok(Box::new(file))
    }

    async fn create_write(&self, path: &str) -> Result<RemoteWriter, FsError> {
        let file = self
            .sftp
            .open_with_flags(path, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
            .await?;
        Ok(Box::new(file))
    }

    fn transport_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    fn protocol_alive(&self) -> bool {
        !self.protocol_closed.load(Ordering::Acquire)
    }

    async fn close_transport(&self) -> Result<(), FsError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await
            .map_err(|e| FsError::Protocol(format!("disconnect failed: {}", e)))
    }

    async fn close_protocol(&self) -> Result<(), FsError> {
        if self.protocol_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Channel already went down with the connection
        if self.handle.is_closed() {
            return Ok(());
        }
        self.sftp.close().await?;
        Ok(())
    }
}
