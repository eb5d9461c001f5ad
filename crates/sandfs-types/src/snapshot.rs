//! Serialized snapshot document.
//!
//! The document is self-describing (`format`) and versioned
//! (`format_version`). Readers ignore unknown fields and reject versions newer
//! than [`SNAPSHOT_FORMAT_VERSION`].

use serde::{Deserialize, Serialize};

use crate::entry::{Metadata, NodeKind};
use crate::path::VfsPath;
use crate::policy::NodePolicy;

/// Value of the `format` field.
pub const SNAPSHOT_FORMAT: &str = "sandfs-snapshot";

/// Highest snapshot format version this crate understands.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Top-level snapshot document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub format: String,
    pub format_version: u32,
    pub root_label: String,
    /// Milliseconds since the Unix epoch.
    pub created_ms: u64,
    /// Nodes in parent-before-child order.
    pub nodes: Vec<NodeRecord>,
}

/// One concrete node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub path: VfsPath,
    pub kind: NodeKind,
    /// Base64 file content. Absent for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_ms: u64,
    #[serde(default)]
    pub modified_ms: u64,
    /// Explicit policy, if one was set for this path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<NodePolicy>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ignores_unknown_fields() {
        let json = r#"{
            "path": "/a.txt",
            "kind": "file",
            "content": "aGk=",
            "version": 3,
            "future_field": true
        }"#;
        let record: NodeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, NodeKind::File);
        assert_eq!(record.version, 3);
        assert!(record.policy.is_none());
    }
}
