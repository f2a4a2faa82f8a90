//! Overwrite policies

use serde::{Deserialize, Serialize};

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    #[default]
    Always,
    Never,
    /// Source mtime strictly newer than destination's
    IfNewer,
    IfDifferentSize,
    IfNewerOrDifferentSize,
}

/// Size and mtime (unix seconds) of one side of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub mtime: Option<u64>,
}

impl OverwritePolicy {
    /// Whether a transfer of `source` may replace `existing`. A missing
    /// destination is always accepted.
    pub fn allows(&self, source: &FileStamp, existing: Option<&FileStamp>) -> bool {
        let Some(existing) = existing else {
            return true;
        };

        let newer = matches!(
            (source.mtime, existing.mtime),
            (Some(src), Some(dst)) if src > dst
        );
        let different_size = source.size != existing.size;

        match self {
            Self::Always => true,
            Self::Never => false,
            Self::IfNewer => newer,
            Self::IfDifferentSize => different_size,
            Self::IfNewerOrDifferentSize => newer || different_size,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::IfNewer => "if_newer",
            Self::IfDifferentSize => "if_different_size",
            Self::IfNewerOrDifferentSize => "if_newer_or_different_size",
        }
    }
}
