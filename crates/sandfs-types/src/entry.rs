//! Directory entries and node metadata.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::path::VfsPath;
use crate::policy::NodePolicy;

/// Free-form metadata attached to nodes, passed through to providers.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// File bytes together with the version they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub content: Vec<u8>,
    pub version: u64,
}

impl FileData {
    /// Content as text, replacing invalid UTF-8.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// A directory entry returned by `list_dir`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// Name of the entry (not full path).
    pub name: String,
    pub path: VfsPath,
    pub kind: NodeKind,
    /// Size in bytes (0 for directories and unresolved dynamic files).
    pub size: u64,
    /// File version (0 for directories).
    pub version: u64,
    pub modified: SystemTime,
    /// Effective policy of the entry.
    pub policy: NodePolicy,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Full metadata for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStat {
    pub path: VfsPath,
    pub kind: NodeKind,
    pub size: u64,
    pub version: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub policy: NodePolicy,
    /// True if the node was materialized by a provider and not modified since.
    pub provided: bool,
    pub metadata: Metadata,
}
