//! Oxide Transfer - pooled SFTP file transfer
//!
//! A [`TransferClient`] keeps a bounded [`SessionPool`] of authenticated
//! SFTP sessions and runs uploads, downloads and remote file operations on
//! them. Session creation and pool acquisition go through a [`Retrier`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod retry;
pub mod transport;

pub use auth::{AuthMethod, AuthProvider};
pub use client::{
    FileInfo, ListFilter, OverwritePolicy, ProgressInfo, ProgressSink, TransferClient,
    TransferOptions, TransferOutcome,
};
pub use config::{AuthConfig, Config, ConnectionConfig, TransferConfig};
pub use error::{ConnectionError, Error, Result};
pub use logging::init_tracing;
pub use pool::{PoolStats, SessionPool};
pub use retry::{BackoffStrategy, RetryConfig, Retrier};
pub use transport::{HostKeyPolicy, SshConnector};
