//! Error taxonomy for sandbox operations.
//!
//! Every tree operation returns a typed [`VfsError`]; nothing in the sandbox
//! aborts the process. Provider and hook failures are converted into these
//! kinds at their call boundary.

use std::fmt;

use thiserror::Error;

use crate::path::VfsPath;

/// Result type for sandbox operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Path resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path escapes sandbox root: {0}")]
    EscapesRoot(String),
    #[error("malformed path {path:?}: {reason}")]
    Malformed { path: String, reason: String },
}

impl PathError {
    pub(crate) fn malformed(path: &str, reason: &str) -> Self {
        PathError::Malformed {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Why a policy check refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotReadable,
    NotWritable,
    NotAppendable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::NotReadable => "not readable",
            DenyReason::NotWritable => "not writable",
            DenyReason::NotAppendable => "append not allowed",
        })
    }
}

/// Host bridge failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostBridgeError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("{program}: timed out after {after_ms}ms")]
    Timeout { program: String, after_ms: u64 },
    #[error("materialize failed: {0}")]
    MaterializeFailed(String),
}

/// Sandbox operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("not found: {0}")]
    NotFound(VfsPath),
    #[error("not a directory: {0}")]
    NotADirectory(VfsPath),
    #[error("not a file: {0}")]
    NotAFile(VfsPath),
    #[error("already exists: {0}")]
    AlreadyExists(VfsPath),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(VfsPath),
    #[error("permission denied: {path}: {reason}")]
    PermissionDenied { path: VfsPath, reason: DenyReason },
    #[error("version conflict on {path}: expected {expected}, current {current}")]
    VersionConflict {
        path: VfsPath,
        expected: u64,
        current: u64,
    },
    #[error("provider failed for {path}: {cause}")]
    Provider { path: VfsPath, cause: String },
    #[error("host bridge: {0}")]
    HostBridge(#[from] HostBridgeError),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl VfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, VfsError::PermissionDenied { .. })
    }

    /// The version a conflicting write lost against, if this is a conflict.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            VfsError::VersionConflict { current, .. } => Some(*current),
            _ => None,
        }
    }

    pub fn denied(path: &VfsPath, reason: DenyReason) -> Self {
        VfsError::PermissionDenied {
            path: path.clone(),
            reason,
        }
    }
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        VfsError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_path() {
        let path = VfsPath::parse("/docs/a.txt").unwrap();
        assert_eq!(VfsError::NotFound(path.clone()).to_string(), "not found: /docs/a.txt");
        assert_eq!(
            VfsError::denied(&path, DenyReason::NotWritable).to_string(),
            "permission denied: /docs/a.txt: not writable"
        );
    }

    #[test]
    fn conflict_exposes_current_version() {
        let err = VfsError::VersionConflict {
            path: VfsPath::root(),
            expected: 1,
            current: 2,
        };
        assert_eq!(err.current_version(), Some(2));
        assert_eq!(VfsError::Io("x".into()).current_version(), None);
    }
}
