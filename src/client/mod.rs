//! Transfer client
//!
//! Public façade over the session pool. Every operation borrows exactly one
//! pooled session for its duration and returns it on completion, error or
//! cancellation.

mod options;
mod overwrite;
mod path;
mod progress;

pub use options::{FileInfo, ListFilter, TransferOptions, TransferOutcome};
pub use overwrite::{FileStamp, OverwritePolicy};
pub use path::{join_remote_path, parent_remote_path, remote_file_name};
pub use progress::{ProgressInfo, ProgressSink, PROGRESS_INTERVAL};

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::options::ResolvedOptions;
use self::progress::{copy_with_progress, CopyError};
use crate::auth::AuthProvider;
use crate::config::Config;
use crate::error::{ConnectionError, Error, FsError, Result};
use crate::pool::{PoolStats, SessionLease, SessionPool};
use crate::transport::{Connector, FileType, RemoteFs, SshConnector};

/// SFTP transfer client backed by a session pool
pub struct TransferClient<C: Connector = SshConnector> {
    config: Config,
    auth: AuthProvider,
    connector: Arc<C>,
    pool: Mutex<Option<SessionPool<Arc<C>>>>,
}

impl TransferClient<SshConnector> {
    /// Client for the SSH/SFTP server described by `config`.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.merged_with_defaults();
        let connector = SshConnector::from_config(&config.auth, &config.connection);
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> TransferClient<C> {
    /// Client over a custom transport.
    pub fn with_connector(config: Config, connector: C) -> Result<Self> {
        let config = config.merged_with_defaults();
        config.validate()?;
        let auth = AuthProvider::from_config(&config.auth)?;

        Ok(Self {
            config,
            auth,
            connector: Arc::new(connector),
            pool: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the pool if needed and prove one session can be established.
    pub async fn connect(&self, ctx: &CancellationToken) -> Result<()> {
        let pool = {
            let mut guard = self.pool.lock();
            match guard.as_ref() {
                Some(pool) if !pool.is_closed() => pool.clone(),
                _ => {
                    let pool = SessionPool::new(
                        self.connector.clone(),
                        self.auth.clone(),
                        &self.config.connection,
                    )?;
                    *guard = Some(pool.clone());
                    pool
                }
            }
        };

        match pool.lease(ctx).await {
            Ok(lease) => {
                drop(lease);
                info!("Connected to {}", self.config.auth.address());
                Ok(())
            }
            Err(e) => {
                let discarded = {
                    let mut guard = self.pool.lock();
                    let ours = guard.as_ref().is_some_and(|current| current.same_pool(&pool));
                    if ours {
                        guard.take()
                    } else {
                        None
                    }
                };
                if let Some(pool) = discarded {
                    if let Err(close_err) = pool.close().await {
                        debug!("Closing pool after failed connect: {}", close_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the pool. Idempotent; `connect` may be called again afterwards.
    pub async fn close(&self) -> Result<()> {
        let pool = self.pool.lock().take();
        match pool {
            Some(pool) => {
                info!("Closing connection to {}", self.config.auth.address());
                pool.close().await
            }
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pool.lock().is_some()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().as_ref().map(SessionPool::stats)
    }

    async fn lease(&self, ctx: &CancellationToken) -> Result<SessionLease<Arc<C>>> {
        let pool = self
            .pool
            .lock()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        pool.lease(ctx).await
    }

    /// Upload a local file to `remote`.
    pub async fn upload(
        &self,
        ctx: &CancellationToken,
        local: impl AsRef<Path>,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let local = local.as_ref();
        let local_display = local.display().to_string();
        let opts = options.resolve(&self.config.transfer);
        let started = Instant::now();

        let local_meta = match tokio::fs::metadata(local).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound {
                    path: local_display,
                })
            }
            Err(e) => return Err(Error::data_transfer("upload", local_display, e)),
        };
        if local_meta.is_dir() {
            return Err(Error::data_transfer("upload", local_display, "source is a directory"));
        }

        let session = self.lease(ctx).await?;

        let existing = remote_stamp(&*session, "upload", remote).await?;
        let source = FileStamp {
            size: local_meta.len(),
            mtime: local_meta.modified().ok().and_then(unix_secs),
        };
        check_overwrite(&opts, "upload", remote, &source, existing.as_ref())?;

        if opts.create_dirs {
            if let Some(parent) = parent_remote_path(remote) {
                ensure_remote_dir(&*session, "upload", parent).await?;
            }
        }

        debug!("Uploading {} -> {}", local_display, remote);
        let mut reader = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::data_transfer("upload", local_display.clone(), e))?;
        let mut writer = session
            .create_write(remote)
            .await
            .map_err(|e| Error::from_fs("upload", remote, e))?;

        let bytes = copy_with_progress(
            &mut reader,
            &mut writer,
            local_meta.len(),
            opts.buffer_size,
            opts.progress.as_ref(),
            PROGRESS_INTERVAL,
            ctx,
        )
        .await
        .map_err(|e| copy_error("upload", &local_display, remote, e))?;
        drop(writer);

        if opts.preserve_permissions {
            match local_mode(&local_meta) {
                Some(mode) => {
                    if let Err(e) = session.set_permissions(remote, mode & 0o7777).await {
                        warn!("Failed to preserve permissions on {}: {}", remote, e);
                    }
                }
                None => debug!("No permission bits available for {}", local_display),
            }
        }

        let outcome = TransferOutcome {
            bytes,
            elapsed: started.elapsed(),
        };
        info!(
            "Uploaded {} -> {} ({} bytes in {:?})",
            local_display, remote, outcome.bytes, outcome.elapsed
        );
        Ok(outcome)
    }

    /// Download `remote` into a local file.
    pub async fn download(
        &self,
        ctx: &CancellationToken,
        remote: &str,
        local: impl AsRef<Path>,
        options: &TransferOptions,
    ) -> Result<TransferOutcome> {
        let local = local.as_ref();
        let local_display = local.display().to_string();
        let opts = options.resolve(&self.config.transfer);
        let started = Instant::now();

        let session = self.lease(ctx).await?;

        let remote_meta = session
            .stat(remote)
            .await
            .map_err(|e| Error::from_fs("download", remote, e))?;
        if remote_meta.is_dir() {
            return Err(Error::data_transfer("download", remote, "source is a directory"));
        }

        let existing = match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::data_transfer(
                    "download",
                    local_display,
                    "destination is a directory",
                ))
            }
            Ok(meta) => Some(FileStamp {
                size: meta.len(),
                mtime: meta.modified().ok().and_then(unix_secs),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::data_transfer("download", local_display, e)),
        };
        let source = FileStamp {
            size: remote_meta.size,
            mtime: remote_meta.mtime,
        };
        check_overwrite(&opts, "download", &local_display, &source, existing.as_ref())?;

        if opts.create_dirs {
            if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::data_transfer("download", parent.display().to_string(), e)
                })?;
            }
        }

        debug!("Downloading {} -> {}", remote, local_display);
        let mut reader = session
            .open_read(remote)
            .await
            .map_err(|e| Error::from_fs("download", remote, e))?;
        let mut writer = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::data_transfer("download", local_display.clone(), e))?;

        let bytes = copy_with_progress(
            &mut reader,
            &mut writer,
            remote_meta.size,
            opts.buffer_size,
            opts.progress.as_ref(),
            PROGRESS_INTERVAL,
            ctx,
        )
        .await
        .map_err(|e| copy_error("download", remote, &local_display, e))?;
        drop(writer);

        if opts.preserve_permissions {
            if let Some(mode) = remote_meta.permissions {
                if let Err(e) = set_local_mode(local, mode & 0o7777).await {
                    warn!("Failed to preserve permissions on {}: {}", local_display, e);
                }
            }
        }

        let outcome = TransferOutcome {
            bytes,
            elapsed: started.elapsed(),
        };
        info!(
            "Downloaded {} -> {} ({} bytes in {:?})",
            remote, local_display, outcome.bytes, outcome.elapsed
        );
        Ok(outcome)
    }

    /// List a remote directory, directories first then by name.
    pub async fn list(
        &self,
        ctx: &CancellationToken,
        remote: &str,
        filter: Option<ListFilter>,
    ) -> Result<Vec<FileInfo>> {
        let pattern = match filter.as_ref().and_then(|f| f.pattern.as_deref()) {
            Some(p) => Some(
                glob::Pattern::new(p)
                    .map_err(|e| Error::config(format!("invalid list pattern {:?}: {}", p, e)))?,
            ),
            None => None,
        };

        let session = self.lease(ctx).await?;
        let entries = session
            .read_dir(remote)
            .await
            .map_err(|e| Error::from_fs("list", remote, e))?;

        let mut files: Vec<FileInfo> = entries
            .into_iter()
            .filter(|entry| match &filter {
                Some(f) => f.show_hidden || !entry.name.starts_with('.'),
                None => true,
            })
            .filter(|entry| pattern.as_ref().map_or(true, |p| p.matches(&entry.name)))
            .map(|entry| {
                let path = join_remote_path(remote, &entry.name);
                FileInfo::from_metadata(entry.name, path, &entry.metadata)
            })
            .collect();

        files.sort_by(|a, b| b.is_dir().cmp(&a.is_dir()).then_with(|| a.name.cmp(&b.name)));

        debug!("Listed {} entries in {}", files.len(), remote);
        Ok(files)
    }

    /// Create a remote directory and any missing parents.
    pub async fn mkdir(&self, ctx: &CancellationToken, remote: &str) -> Result<()> {
        let session = self.lease(ctx).await?;
        ensure_remote_dir(&*session, "mkdir", remote).await
    }

    /// Remove a file or a directory tree. Returns the number of entries removed.
    pub async fn remove(&self, ctx: &CancellationToken, remote: &str) -> Result<usize> {
        let session = self.lease(ctx).await?;
        let metadata = session
            .lstat(remote)
            .await
            .map_err(|e| Error::from_fs("remove", remote, e))?;

        let removed = if metadata.is_dir() {
            remove_recursive(&*session, ctx, remote.to_string()).await?
        } else {
            session
                .remove_file(remote)
                .await
                .map_err(|e| Error::from_fs("remove", remote, e))?;
            1
        };

        info!("Removed {} ({} entries)", remote, removed);
        Ok(removed)
    }

    pub async fn rename(&self, ctx: &CancellationToken, from: &str, to: &str) -> Result<()> {
        let session = self.lease(ctx).await?;
        session.rename(from, to).await.map_err(|e| match e {
            FsError::NotFound(_) => Error::FileNotFound {
                path: from.to_string(),
            },
            other => Error::data_transfer("rename", format!("{} -> {}", from, to), other),
        })?;
        info!("Renamed {} -> {}", from, to);
        Ok(())
    }

    pub async fn stat(&self, ctx: &CancellationToken, remote: &str) -> Result<FileInfo> {
        let session = self.lease(ctx).await?;
        let metadata = session
            .stat(remote)
            .await
            .map_err(|e| Error::from_fs("stat", remote, e))?;
        Ok(FileInfo::from_metadata(
            remote_file_name(remote).to_string(),
            remote.to_string(),
            &metadata,
        ))
    }

    pub async fn exists(&self, ctx: &CancellationToken, remote: &str) -> Result<bool> {
        match self.stat(ctx, remote).await {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

#[cfg(unix)]
fn local_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode())
}

#[cfg(not(unix))]
fn local_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
async fn set_local_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_local_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn copy_error(op: &'static str, source: &str, destination: &str, err: CopyError) -> Error {
    match err {
        CopyError::Cancelled => Error::Cancelled,
        CopyError::Read(e) => Error::data_transfer(op, source, format!("read failed: {}", e)),
        CopyError::Write(e) => Error::data_transfer(op, destination, format!("write failed: {}", e)),
    }
}

fn check_overwrite(
    opts: &ResolvedOptions,
    op: &'static str,
    destination: &str,
    source: &FileStamp,
    existing: Option<&FileStamp>,
) -> Result<()> {
    if opts.overwrite.allows(source, existing) {
        return Ok(());
    }
    debug!(
        "Overwrite policy {} rejected {} (source {:?}, existing {:?})",
        opts.overwrite.as_str(),
        destination,
        source,
        existing
    );
    Err(Error::data_transfer(
        op,
        destination,
        format!(
            "destination exists and overwrite policy {} rejected it",
            opts.overwrite.as_str()
        ),
    ))
}

/// Size and mtime of a remote destination, `None` when it does not exist.
async fn remote_stamp<S: RemoteFs + ?Sized>(
    session: &S,
    op: &'static str,
    remote: &str,
) -> Result<Option<FileStamp>> {
    match session.stat(remote).await {
        Ok(meta) if meta.is_dir() => Err(Error::data_transfer(op, remote, "destination is a directory")),
        Ok(meta) => Ok(Some(FileStamp {
            size: meta.size,
            mtime: meta.mtime,
        })),
        Err(FsError::NotFound(_)) => Ok(None),
        Err(e) => Err(Error::from_fs(op, remote, e)),
    }
}

/// Create `dir` and its missing ancestors. Walks up to the nearest existing
/// ancestor, then creates the rest top-down.
async fn ensure_remote_dir<S: RemoteFs + ?Sized>(session: &S, op: &'static str, dir: &str) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = Some(path::trim_remote_path(dir));

    while let Some(p) = current {
        match session.stat(p).await {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => {
                return Err(Error::data_transfer(op, p, "exists but is not a directory"));
            }
            Err(FsError::NotFound(_)) => {
                missing.push(p.to_string());
                current = parent_remote_path(p);
            }
            Err(e) => return Err(Error::from_fs(op, p, e)),
        }
    }

    for p in missing.iter().rev() {
        match session.create_dir(p).await {
            Ok(()) => debug!("Created remote directory {}", p),
            Err(e) => {
                // Another caller may have created it meanwhile
                if matches!(session.stat(p).await, Ok(meta) if meta.is_dir()) {
                    continue;
                }
                return Err(Error::from_fs(op, p, e));
            }
        }
    }

    Ok(())
}

/// Depth-first delete. Symlinks are removed, never followed.
fn remove_recursive<'a, S: RemoteFs + ?Sized>(
    session: &'a S,
    ctx: &'a CancellationToken,
    dir: String,
) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
    Box::pin(async move {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entries = session
            .read_dir(&dir)
            .await
            .map_err(|e| Error::from_fs("remove", &dir, e))?;

        let mut removed = 0;
        for entry in entries {
            let child = join_remote_path(&dir, &entry.name);
            if entry.metadata.file_type == FileType::Directory {
                removed += remove_recursive(session, ctx, child).await?;
            } else {
                session
                    .remove_file(&child)
                    .await
                    .map_err(|e| Error::from_fs("remove", &child, e))?;
                removed += 1;
            }
        }

        session
            .remove_dir(&dir)
            .await
            .map_err(|e| Error::from_fs("remove", &dir, e))?;
        Ok(removed + 1)
    })
}
