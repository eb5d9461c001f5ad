//! Events delivered to write hooks and path hooks.

use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

use crate::path::VfsPath;

/// A committed write, delivered to every write hook whose prefix matches.
///
/// Built once per successful write; `version` is the post-commit version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub path: VfsPath,
    /// Full file content after the write.
    pub content: Vec<u8>,
    pub version: u64,
    pub timestamp: SystemTime,
    /// True if the write was an append.
    pub append: bool,
}

impl WriteEvent {
    /// Content as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Kind of change reported to path hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEventKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for PathEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathEventKind::Create => "create",
            PathEventKind::Update => "update",
            PathEventKind::Delete => "delete",
        })
    }
}

/// A file lifecycle change: creation, update or deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    pub path: VfsPath,
    pub kind: PathEventKind,
    /// Content after the change; `None` for deletions.
    pub content: Option<Vec<u8>>,
}

/// A hook that failed after a write was committed.
///
/// The write stands; the failure is only reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookWarning {
    /// Prefix the failing hook was registered on.
    pub hook_prefix: VfsPath,
    pub path: VfsPath,
    pub message: String,
}

impl fmt::Display for HookWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hook on {} failed for {}: {}",
            self.hook_prefix, self.path, self.message
        )
    }
}

/// Result of a successful write or append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: VfsPath,
    /// Version after the commit.
    pub version: u64,
    /// Non-fatal hook failures.
    pub warnings: Vec<HookWarning>,
}

impl WriteOutcome {
    /// True if every hook ran without error.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
