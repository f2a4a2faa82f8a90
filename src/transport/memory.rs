//! In-memory transport for tests
//!
//! A tree of files and directories behind one mutex, shared by every
//! session the connector hands out. Failure injection knobs live on
//! [`MemoryConnector`] and on each session's [`SessionControl`].

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use super::{Connector, FileType, RemoteEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteWriter};
use crate::auth::Credential;
use crate::error::{ConnectionError, Error, FsError};

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32, mtime: u64 },
    File { data: Vec<u8>, mode: u32, mtime: u64 },
}

impl Node {
    fn metadata(&self) -> RemoteMetadata {
        match self {
            Node::Dir { mode, mtime } => RemoteMetadata {
                file_type: FileType::Directory,
                size: 0,
                mtime: Some(*mtime),
                permissions: Some(0o040000 | mode),
            },
            Node::File { data, mode, mtime } => RemoteMetadata {
                file_type: FileType::File,
                size: data.len() as u64,
                mtime: Some(*mtime),
                permissions: Some(0o100000 | mode),
            },
        }
    }
}

const DEFAULT_MTIME: u64 = 1_700_000_000;

fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) if trimmed.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

fn normalize(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Shared file tree
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                mode: 0o755,
                mtime: DEFAULT_MTIME,
            },
        );
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, creating parent directories.
    pub fn put_file(&self, path: &str, data: &[u8], mtime: u64) {
        let path = normalize(path);
        let mut nodes = self.nodes.lock();
        if let Some(parent) = parent_of(&path) {
            Self::ensure_dirs(&mut nodes, parent);
        }
        nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                mode: 0o644,
                mtime,
            },
        );
    }

    /// Insert a directory, creating parents.
    pub fn put_dir(&self, path: &str) {
        Self::ensure_dirs(&mut self.nodes.lock(), &normalize(path));
    }

    fn ensure_dirs(nodes: &mut BTreeMap<String, Node>, dir: &str) {
        let mut chain = vec![dir.to_string()];
        let mut cur = parent_of(dir);
        while let Some(p) = cur {
            chain.push(p.to_string());
            cur = parent_of(p);
        }
        for dir in chain.into_iter().rev() {
            nodes.entry(dir).or_insert(Node::Dir {
                mode: 0o755,
                mtime: DEFAULT_MTIME,
            });
        }
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(Node::File { mode, .. }) | Some(Node::Dir { mode, .. }) => Some(*mode),
            None => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(&normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(&normalize(path)), Some(Node::Dir { .. }))
    }

    fn require_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), FsError> {
        match parent_of(path) {
            None => Ok(()),
            Some(parent) => match nodes.get(parent) {
                Some(Node::Dir { .. }) => Ok(()),
                Some(Node::File { .. }) => Err(FsError::Protocol(format!("{} is not a directory", parent))),
                None => Err(FsError::NotFound(parent.to_string())),
            },
        }
    }
}

/// Per-session health switches visible to tests
#[derive(Debug, Default)]
pub struct SessionControl {
    pub id: usize,
    pub fail_ping: AtomicBool,
    /// Ping never answers
    pub hang_ping: AtomicBool,
    /// Ping answers successfully after this delay
    pub ping_delay: Mutex<Option<Duration>>,
    pub transport_dead: AtomicBool,
    pub protocol_closed: AtomicBool,
    pub pings: AtomicUsize,
    pub close_order: Mutex<Vec<&'static str>>,
    pub fail_set_permissions: AtomicBool,
}

pub struct MemorySession {
    fs: MemoryFs,
    control: Arc<SessionControl>,
}

impl MemorySession {
    fn check_open(&self) -> Result<(), FsError> {
        if self.control.transport_dead.load(Ordering::SeqCst)
            || self.control.protocol_closed.load(Ordering::SeqCst)
        {
            return Err(FsError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemorySession {
    async fn ping(&self) -> Result<(), FsError> {
        self.control.pings.fetch_add(1, Ordering::SeqCst);
        self.check_open()?;
        if self.control.fail_ping.load(Ordering::SeqCst) {
            return Err(FsError::Closed);
        }
        if self.control.hang_ping.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.control.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        self.check_open()?;
        self.fs
            .nodes
            .lock()
            .get(&normalize(path))
            .map(Node::metadata)
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteMetadata, FsError> {
        self.stat(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, FsError> {
        self.check_open()?;
        let dir = normalize(path);
        let nodes = self.fs.nodes.lock();
        match nodes.get(&dir) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => return Err(FsError::Protocol(format!("{} is not a directory", dir))),
            None => return Err(FsError::NotFound(dir)),
        }

        Ok(nodes
            .iter()
            .filter(|(p, _)| p.as_str() != dir && parent_of(p) == Some(dir.as_str()))
            .map(|(p, node)| RemoteEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                metadata: node.metadata(),
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), FsError> {
        self.check_open()?;
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(FsError::Protocol(format!("{} already exists", path)));
        }
        MemoryFs::require_parent_dir(&nodes, &path)?;
        nodes.insert(
            path,
            Node::Dir {
                mode: 0o755,
                mtime: DEFAULT_MTIME,
            },
        );
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FsError> {
        self.check_open()?;
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(&path) {
            Some(Node::File { .. }) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(FsError::Protocol(format!("{} is a directory", path))),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        self.check_open()?;
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                if nodes.keys().any(|p| parent_of(p) == Some(path.as_str())) {
                    return Err(FsError::Protocol(format!("{} is not empty", path)));
                }
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::File { .. }) => Err(FsError::Protocol(format!("{} is not a directory", path))),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.check_open()?;
        let from = normalize(from);
        let to = normalize(to);
        let mut nodes = self.fs.nodes.lock();
        if !nodes.contains_key(&from) {
            return Err(FsError::NotFound(from));
        }
        if nodes.contains_key(&to) {
            return Err(FsError::Protocol(format!("{} already exists", to)));
        }
        MemoryFs::require_parent_dir(&nodes, &to)?;

        let prefix = format!("{}/", from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|p| **p == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn set_permissions(&self, path: &str, new_mode: u32) -> Result<(), FsError> {
        self.check_open()?;
        if self.control.fail_set_permissions.load(Ordering::SeqCst) {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        let mut nodes = self.fs.nodes.lock();
        match nodes.get_mut(&normalize(path)) {
            Some(Node::File { mode, .. }) | Some(Node::Dir { mode, .. }) => {
                *mode = new_mode & 0o7777;
                Ok(())
            }
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, FsError> {
        self.check_open()?;
        match self.fs.nodes.lock().get(&normalize(path)) {
            Some(Node::File { data, .. }) => Ok(Box::new(io::Cursor::new(data.clone()))),
            Some(Node::Dir { .. }) => Err(FsError::Protocol(format!("{} is a directory", path))),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    async fn create_write(&self, path: &str) -> Result<RemoteWriter, FsError> {
        self.check_open()?;
        let path = normalize(path);
        let mut nodes = self.fs.nodes.lock();
        MemoryFs::require_parent_dir(&nodes, &path)?;
        if let Some(Node::Dir { .. }) = nodes.get(&path) {
            return Err(FsError::Protocol(format!("{} is a directory", path)));
        }
        nodes.insert(
            path.clone(),
            Node::File {
                data: Vec::new(),
                mode: 0o644,
                mtime: DEFAULT_MTIME,
            },
        );
        Ok(Box::new(MemoryWriter {
            fs: self.fs.clone(),
            path,
        }))
    }

    fn transport_alive(&self) -> bool {
        !self.control.transport_dead.load(Ordering::SeqCst)
    }

    fn protocol_alive(&self) -> bool {
        !self.control.protocol_closed.load(Ordering::SeqCst)
    }

    async fn close_transport(&self) -> Result<(), FsError> {
        self.control.close_order.lock().push("transport");
        self.control.transport_dead.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_protocol(&self) -> Result<(), FsError> {
        self.control.close_order.lock().push("protocol");
        self.control.protocol_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Appends straight into the shared tree on every write
struct MemoryWriter {
    fs: MemoryFs,
    path: String,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut nodes = self.fs.nodes.lock();
        match nodes.get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                data.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotFound, "file vanished"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connector handing out [`MemorySession`]s over one [`MemoryFs`]
#[derive(Default)]
pub struct MemoryConnector {
    pub fs: MemoryFs,
    pub connects: AtomicUsize,
    /// Fail this many upcoming connects with a dial error
    pub fail_connects: AtomicU32,
    pub reject_auth: AtomicBool,
    pub connect_delay: Mutex<Option<Duration>>,
    pub sessions: Mutex<Vec<Arc<SessionControl>>>,
}

impl MemoryConnector {
    pub fn new(fs: MemoryFs) -> Self {
        Self {
            fs,
            ..Default::default()
        }
    }

    pub fn session(&self, index: usize) -> Arc<SessionControl> {
        self.sessions.lock()[index].clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, _username: &str, credentials: &[Credential]) -> Result<MemorySession, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::Dial("connection refused".into()).into());
        }

        if self.reject_auth.load(Ordering::SeqCst) || credentials.is_empty() {
            return Err(Error::authentication("Authentication rejected by server"));
        }

        let mut sessions = self.sessions.lock();
        let control = Arc::new(SessionControl {
            id: sessions.len(),
            ..Default::default()
        });
        sessions.push(control.clone());

        Ok(MemorySession {
            fs: self.fs.clone(),
            control,
        })
    }
}
