//! Transport seam
//!
//! The pool and the transfer client only talk to these two traits:
//! a [`Connector`] dials and authenticates, the resulting session
//! implements [`RemoteFs`]. The SSH/SFTP implementation lives in [`ssh`].

pub mod host_key;
pub mod ssh;

#[cfg(test)]
pub(crate) mod memory;

pub use host_key::{fingerprint, HostKeyPolicy, HostKeyVerifier};
pub use ssh::{SshConnector, SshSession};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::Credential;
use crate::error::{Error, FsError};

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// File type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Attributes of a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub file_type: FileType,
    pub size: u64,
    /// Modification time, unix seconds
    pub mtime: Option<u64>,
    /// Mode bits as reported by the server
    pub permissions: Option<u32>,
}

impl RemoteMetadata {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// One directory entry
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// File operations on one established session.
///
/// Paths are absolute or relative to the server's working directory; the
/// implementation passes them through unchanged.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Lightweight round trip proving the session still answers.
    async fn ping(&self) -> Result<(), FsError>;

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError>;

    /// Like [`stat`](Self::stat) without following a final symlink.
    async fn lstat(&self, path: &str) -> Result<RemoteMetadata, FsError>;

    /// Entries of a directory, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError>;

    async fn create_dir(&self, path: &str) -> Result<(), FsError>;

    async fn remove_file(&self, path: &str) -> Result<(), FsError>;

    async fn remove_dir(&self, path: &str) -> Result<(), FsError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), FsError>;

    async fn open_read(&self, path: &str) -> Result<RemoteReader, FsError>;

    /// Create or truncate `path` for writing.
    async fn create_write(&self, path: &str) -> Result<RemoteWriter, FsError>;

    fn transport_alive(&self) -> bool;

    fn protocol_alive(&self) -> bool;

    async fn close_transport(&self) -> Result<(), FsError>;

    async fn close_protocol(&self) -> Result<(), FsError>;
}

/// Dials and authenticates new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: RemoteFs + 'static;

    /// Establish one session. Authentication rejections are reported as
    /// [`Error::Authentication`], host key rejections and network failures
    /// as [`Error::Connection`].
    async fn connect(&self, username: &str, credentials: &[Credential])
        -> Result<Self::Session, Error>;
}

#[async_trait]
impl<C: Connector> Connector for Arc<C> {
    type Session = C::Session;

    async fn connect(&self, username: &str, credentials: &[Credential])
        -> Result<Self::Session, Error> {
        (**self).connect(username, credentials).await
    }
}
