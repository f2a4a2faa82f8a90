//! Transfer client data types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::overwrite::OverwritePolicy;
use super::progress::ProgressSink;
use crate::config::TransferConfig;
use crate::transport::{FileType, RemoteMetadata};

/// Per-call overrides; unset fields fall back to the client's
/// [`TransferConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub create_dirs: Option<bool>,
    pub preserve_permissions: Option<bool>,
    pub overwrite: Option<OverwritePolicy>,
    pub buffer_size: Option<usize>,
    pub progress: Option<ProgressSink>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_dirs(mut self, create: bool) -> Self {
        self.create_dirs = Some(create);
        self
    }

    pub fn preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = Some(preserve);
        self
    }

    pub fn overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = Some(policy);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub(crate) fn resolve(&self, defaults: &TransferConfig) -> ResolvedOptions {
        ResolvedOptions {
            create_dirs: self.create_dirs.unwrap_or(defaults.create_dirs),
            preserve_permissions: self
                .preserve_permissions
                .unwrap_or(defaults.preserve_permissions),
            overwrite: self.overwrite.unwrap_or(defaults.overwrite),
            buffer_size: self
                .buffer_size
                .filter(|s| *s > 0)
                .unwrap_or(defaults.buffer_size),
            progress: self.progress.clone().or_else(|| defaults.progress.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub create_dirs: bool,
    pub preserve_permissions: bool,
    pub overwrite: OverwritePolicy,
    pub buffer_size: usize,
    pub progress: Option<ProgressSink>,
}

/// Result of a completed upload or download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub elapsed: Duration,
}

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    pub path: String,
    pub file_type: FileType,
    pub size: u64,
    /// Last modified time (Unix timestamp), 0 when unknown
    pub modified: u64,
    /// Permission bits (`mode & 0o7777`)
    pub permissions: Option<u32>,
}

impl FileInfo {
    pub(crate) fn from_metadata(name: String, path: String, metadata: &RemoteMetadata) -> Self {
        Self {
            name,
            path,
            file_type: metadata.file_type,
            size: metadata.size,
            modified: metadata.mtime.unwrap_or(0),
            permissions: metadata.permissions.map(|m| m & 0o7777),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Permissions as an octal string, e.g. "755"
    pub fn permissions_octal(&self) -> Option<String> {
        self.permissions.map(|p| format!("{:o}", p))
    }
}

/// Filter for directory listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    /// Show hidden files (starting with .)
    #[serde(default)]
    pub show_hidden: bool,
    /// File name pattern to match (glob-style)
    #[serde(default)]
    pub pattern: Option<String>,
}
