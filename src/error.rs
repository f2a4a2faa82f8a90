//! Error types
//!
//! One taxonomy for every caller-facing failure. Transport implementations
//! report [`FsError`]; the transfer client maps those into [`Error`] with the
//! operation and path attached.

use thiserror::Error;

use crate::retry::Cancelled;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Data transfer error during {op} of {path}: {message}")]
    DataTransfer {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Connection-level failures, including pool state.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection pool exhausted ({max} sessions in use)")]
    PoolExhausted { max: usize },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection not found in pool")]
    ConnectionNotFound,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to close sessions: {}", .0.join("; "))]
    Close(Vec<String>),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Error::Authentication(msg.into())
    }

    pub fn data_transfer(op: &'static str, path: impl Into<String>, msg: impl ToString) -> Self {
        Error::DataTransfer {
            op,
            path: path.into(),
            message: msg.to_string(),
        }
    }

    /// Map a transport error for `op` on `path`. `NotFound` becomes
    /// [`Error::FileNotFound`], everything else a data transfer error.
    pub fn from_fs(op: &'static str, path: &str, err: FsError) -> Self {
        match err {
            FsError::NotFound(_) => Error::FileNotFound {
                path: path.to_string(),
            },
            other => Error::data_transfer(op, path, other),
        }
    }

    /// Failures that no amount of retrying will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Authentication(_)
                | Error::Cancelled
                | Error::Connection(ConnectionError::PoolClosed)
                | Error::Connection(ConnectionError::HostKeyRejected(_))
        )
    }

    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::Connection(ConnectionError::PoolExhausted { .. }))
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}

/// Errors reported by a [`RemoteFs`](crate::transport::RemoteFs) implementation.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    Closed,
}

impl From<russh_sftp::client::error::Error> for FsError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as SftpErr;
        use russh_sftp::protocol::StatusCode;

        match err {
            SftpErr::Status(status) => match status.status_code {
                StatusCode::NoSuchFile => FsError::NotFound(status.error_message),
                StatusCode::PermissionDenied => FsError::PermissionDenied(status.error_message),
                StatusCode::NoConnection | StatusCode::ConnectionLost => FsError::Closed,
                _ => FsError::Protocol(status.error_message),
            },
            SftpErr::IO(msg) => FsError::Protocol(format!("IO: {}", msg)),
            other => FsError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
