//! Snapshot and restore of the concrete tree.
//!
//! A snapshot captures the shared tree: files and directories created or
//! modified through the API, their versions, timestamps, metadata and
//! explicit policies. Provider listings live outside the tree and dynamic
//! file content is never stored, so neither is captured; registered mounts
//! stay in place across a restore and are hydrated again on next access.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sandfs_types::{
    NodeKind, NodeRecord, SNAPSHOT_FORMAT, SNAPSHOT_FORMAT_VERSION, SnapshotDocument, VfsError,
    VfsPath, VfsResult,
};

use crate::policy::PolicyTable;
use crate::vfs::{
    Content, DirNode, FileState, MountSource, Node, Origin, Tree, VirtualFileSystem, file_cell,
    lock_file, read_lock, write_lock,
};

/// A validated snapshot document.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    document: SnapshotDocument,
}

impl Snapshot {
    /// Wrap a document, rejecting foreign or newer formats.
    pub fn from_document(document: SnapshotDocument) -> VfsResult<Self> {
        if document.format != SNAPSHOT_FORMAT {
            return Err(VfsError::Snapshot(format!(
                "not a sandfs snapshot (format {:?})",
                document.format
            )));
        }
        if document.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(VfsError::Snapshot(format!(
                "unsupported format version {} (newest known is {})",
                document.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(Self { document })
    }

    pub fn from_bytes(bytes: &[u8]) -> VfsResult<Self> {
        let document: SnapshotDocument = serde_json::from_slice(bytes)
            .map_err(|e| VfsError::Snapshot(format!("invalid snapshot: {e}")))?;
        Self::from_document(document)
    }

    pub fn to_bytes(&self) -> VfsResult<Vec<u8>> {
        serde_json::to_vec_pretty(&self.document)
            .map_err(|e| VfsError::Snapshot(format!("serialize: {e}")))
    }

    pub fn document(&self) -> &SnapshotDocument {
        &self.document
    }

    pub fn into_document(self) -> SnapshotDocument {
        self.document
    }
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

/// Records for `node` and its descendants, parents first. Dynamic files are
/// skipped.
fn capture(node: &Node, path: &VfsPath, policies: &PolicyTable) -> VfsResult<Vec<NodeRecord>> {
    match node {
        Node::File(cell) => {
            let state = lock_file(cell)?;
            let Content::Stored(bytes) = &state.content else {
                return Ok(Vec::new());
            };
            Ok(vec![NodeRecord {
                path: path.clone(),
                kind: NodeKind::File,
                content: Some(BASE64.encode(bytes)),
                version: state.version,
                created_ms: to_millis(state.created),
                modified_ms: to_millis(state.modified),
                policy: policies.explicit(path).cloned(),
                metadata: state.metadata.clone(),
            }])
        }
        Node::Dir(dir) => {
            let mut records = vec![NodeRecord {
                path: path.clone(),
                kind: NodeKind::Directory,
                content: None,
                version: 0,
                created_ms: to_millis(dir.created),
                modified_ms: to_millis(dir.modified),
                policy: policies.explicit(path).cloned(),
                metadata: dir.metadata.clone(),
            }];
            for (name, child) in &dir.children {
                records.extend(capture(child, &path.join(name)?, policies)?);
            }
            Ok(records)
        }
    }
}

/// Build a fresh tree and policy table from a document.
fn rebuild(document: &SnapshotDocument, default_policy: &PolicyTable) -> VfsResult<(Tree, PolicyTable)> {
    let mut tree = Tree::default();
    let mut policies = default_policy.clone();

    for record in &document.nodes {
        let path = &record.path;
        if let Some(policy) = &record.policy {
            policies.set(path.clone(), policy.clone());
        }
        if path.is_root() {
            if let Ok(Node::Dir(root)) = tree.node_mut(path) {
                root.metadata = record.metadata.clone();
                root.created = from_millis(record.created_ms);
                root.modified = from_millis(record.modified_ms);
            }
            continue;
        }
        if let Some(parent) = path.parent() {
            tree.ensure_dirs(&parent)?;
        }

        let node = match record.kind {
            NodeKind::Directory => {
                let mut dir = DirNode::new(Origin::Local);
                dir.created = from_millis(record.created_ms);
                dir.modified = from_millis(record.modified_ms);
                dir.metadata = record.metadata.clone();
                Node::Dir(dir)
            }
            NodeKind::File => {
                let bytes = match &record.content {
                    Some(encoded) => BASE64.decode(encoded).map_err(|e| {
                        VfsError::Snapshot(format!("bad content for {path}: {e}"))
                    })?,
                    None => Vec::new(),
                };
                let mut state = FileState::new(Content::Stored(bytes), record.version, Origin::Local);
                state.created = from_millis(record.created_ms);
                state.modified = from_millis(record.modified_ms);
                state.metadata = record.metadata.clone();
                Node::File(file_cell(state))
            }
        };
        match tree.attach(path, node) {
            Ok(()) => {}
            // Created earlier as a parent of a preceding record.
            Err(VfsError::AlreadyExists(_)) if record.kind == NodeKind::Directory => {
                if let Ok(Node::Dir(dir)) = tree.node_mut(path) {
                    dir.created = from_millis(record.created_ms);
                    dir.modified = from_millis(record.modified_ms);
                    dir.metadata = record.metadata.clone();
                }
            }
            Err(VfsError::AlreadyExists(_)) => {
                return Err(VfsError::Snapshot(format!("duplicate node {path}")));
            }
            Err(err) => return Err(VfsError::Snapshot(format!("cannot restore {path}: {err}"))),
        }
    }
    Ok((tree, policies))
}

impl VirtualFileSystem {
    /// Capture the concrete tree.
    pub fn snapshot(&self) -> VfsResult<Snapshot> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let nodes = capture(tree.root(), &VfsPath::root(), &policies)?;
        tracing::debug!(nodes = nodes.len(), "snapshot taken");

        Ok(Snapshot {
            document: SnapshotDocument {
                format: SNAPSHOT_FORMAT.to_string(),
                format_version: SNAPSHOT_FORMAT_VERSION,
                root_label: self.config.root_label.clone(),
                created_ms: to_millis(SystemTime::now()),
                nodes,
            },
        })
    }

    /// Replace the tree with the snapshot's content.
    ///
    /// The new tree is built before anything is swapped, so a failed restore
    /// leaves the sandbox untouched. Registered mounts are kept and will be
    /// hydrated again.
    pub fn restore(&self, snapshot: &Snapshot) -> VfsResult<()> {
        let default_policies = PolicyTable::new(self.config.effective_default_policy());
        let (mut new_tree, new_policies) = rebuild(&snapshot.document, &default_policies)?;

        let mut tree = write_lock(&self.tree)?;
        let mut policies = write_lock(&self.policies)?;
        let mut mounts = write_lock(&self.mounts)?;

        mounts.reset_to_registered();
        let mut lost = Vec::new();
        for (path, source) in mounts.registered() {
            let result = match source {
                MountSource::Directory(_) => new_tree.ensure_dirs(path).map(|_| ()),
                MountSource::File(provider) => match new_tree.node(path) {
                    Ok(_) => Err(VfsError::AlreadyExists(path.clone())),
                    Err(_) => {
                        let content = Content::dynamic(provider.clone());
                        let state = FileState::new(content, 0, Origin::Local);
                        path.parent()
                            .map_or(Ok(Vec::new()), |parent| new_tree.ensure_dirs(&parent))
                            .and_then(|_| new_tree.attach(path, Node::File(file_cell(state))))
                    }
                },
            };
            if let Err(err) = result {
                tracing::warn!(path = %path, "mount dropped on restore: {}", err);
                lost.push(path.clone());
            }
        }
        for path in lost {
            mounts.remove(&path);
        }

        *tree = new_tree;
        *policies = new_policies;
        tracing::info!(
            label = %snapshot.document.root_label,
            nodes = snapshot.document.nodes.len(),
            "restored snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_format() {
        let document = SnapshotDocument {
            format: "tarball".into(),
            format_version: 1,
            root_label: "x".into(),
            created_ms: 0,
            nodes: Vec::new(),
        };
        assert!(matches!(
            Snapshot::from_document(document),
            Err(VfsError::Snapshot(_))
        ));
    }

    #[test]
    fn rejects_newer_version() {
        let json = format!(
            r#"{{"format":"{SNAPSHOT_FORMAT}","format_version":{},"root_label":"x","created_ms":0,"nodes":[]}}"#,
            SNAPSHOT_FORMAT_VERSION + 1
        );
        let err = Snapshot::from_bytes(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported format version"));
    }

    #[test]
    fn bad_base64_fails_before_swap() {
        let vfs = VirtualFileSystem::new();
        let document = SnapshotDocument {
            format: SNAPSHOT_FORMAT.into(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            root_label: "x".into(),
            created_ms: 0,
            nodes: vec![NodeRecord {
                path: VfsPath::parse("/a.txt").unwrap(),
                kind: NodeKind::File,
                content: Some("!!not base64!!".into()),
                version: 1,
                created_ms: 0,
                modified_ms: 0,
                policy: None,
                metadata: Default::default(),
            }],
        };
        let snapshot = Snapshot::from_document(document).unwrap();
        assert!(matches!(vfs.restore(&snapshot), Err(VfsError::Snapshot(_))));
    }
}
