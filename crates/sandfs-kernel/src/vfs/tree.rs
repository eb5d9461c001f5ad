//! The node tree.
//!
//! Directories own their children directly. Files live behind their own
//! mutex so a versioned write can be checked and committed while the tree is
//! only read-locked; structural changes take the tree write lock.
//!
//! The shared tree holds locally owned nodes only. Provider output is kept in
//! layers (see `view`), built from the same node types.
//!
//! Lock order is tree, then policies, then mounts, then a file. A context's
//! own tables are taken last and never held across another lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use sandfs_types::{Metadata, VfsError, VfsPath, VfsResult};

use crate::provider::ContentProvider;

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> VfsResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| VfsError::Internal("lock poisoned".into()))
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> VfsResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| VfsError::Internal("lock poisoned".into()))
}

pub(crate) fn lock_file(cell: &Mutex<FileState>) -> VfsResult<MutexGuard<'_, FileState>> {
    cell.lock()
        .map_err(|_| VfsError::Internal("lock poisoned".into()))
}

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// A fresh stamp for dynamic content. Contexts cache resolved bytes per
/// stamp, so a new stamp forces every context to resolve again.
pub(crate) fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Where a node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Created or modified through the sandbox API.
    Local,
    /// Materialized by a provider and untouched since.
    Provided,
}

#[derive(Clone)]
pub(crate) enum Content {
    Stored(Vec<u8>),
    Dynamic {
        provider: Arc<dyn ContentProvider>,
        epoch: u64,
    },
}

impl Content {
    pub(crate) fn dynamic(provider: Arc<dyn ContentProvider>) -> Self {
        Content::Dynamic {
            provider,
            epoch: next_epoch(),
        }
    }

    /// Stored bytes. Dynamic content lives in each context's cache.
    pub(crate) fn bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Stored(bytes) => Some(bytes),
            Content::Dynamic { .. } => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct FileState {
    pub content: Content,
    pub version: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub origin: Origin,
    pub metadata: Metadata,
}

impl FileState {
    pub(crate) fn new(content: Content, version: u64, origin: Origin) -> Self {
        let now = SystemTime::now();
        Self {
            content,
            version,
            created: now,
            modified: now,
            origin,
            metadata: Metadata::new(),
        }
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        matches!(self.content, Content::Dynamic { .. })
    }
}

pub(crate) type FileCell = Arc<Mutex<FileState>>;

pub(crate) fn file_cell(state: FileState) -> FileCell {
    Arc::new(Mutex::new(state))
}

#[derive(Clone)]
pub(crate) struct DirNode {
    pub children: BTreeMap<String, Node>,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub origin: Origin,
    pub metadata: Metadata,
}

impl DirNode {
    pub(crate) fn new(origin: Origin) -> Self {
        let now = SystemTime::now();
        Self {
            children: BTreeMap::new(),
            created: now,
            modified: now,
            origin,
            metadata: Metadata::new(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.modified = SystemTime::now();
    }
}

#[derive(Clone)]
pub(crate) enum Node {
    Dir(DirNode),
    File(FileCell),
}

pub(crate) struct Tree {
    root: Node,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            root: Node::Dir(DirNode::new(Origin::Local)),
        }
    }
}

impl Tree {
    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    pub(crate) fn node(&self, path: &VfsPath) -> VfsResult<&Node> {
        let mut current = &self.root;
        for (depth, segment) in path.segments().iter().enumerate() {
            current = match current {
                Node::Dir(dir) => dir
                    .children
                    .get(segment)
                    .ok_or_else(|| VfsError::NotFound(path.clone()))?,
                Node::File(_) => return Err(VfsError::NotADirectory(path.ancestor(depth))),
            };
        }
        Ok(current)
    }

    pub(crate) fn node_mut(&mut self, path: &VfsPath) -> VfsResult<&mut Node> {
        let mut current = &mut self.root;
        for (depth, segment) in path.segments().iter().enumerate() {
            current = match current {
                Node::Dir(dir) => dir
                    .children
                    .get_mut(segment)
                    .ok_or_else(|| VfsError::NotFound(path.clone()))?,
                Node::File(_) => return Err(VfsError::NotADirectory(path.ancestor(depth))),
            };
        }
        Ok(current)
    }

    pub(crate) fn dir(&self, path: &VfsPath) -> VfsResult<&DirNode> {
        match self.node(path)? {
            Node::Dir(dir) => Ok(dir),
            Node::File(_) => Err(VfsError::NotADirectory(path.clone())),
        }
    }

    pub(crate) fn dir_mut(&mut self, path: &VfsPath) -> VfsResult<&mut DirNode> {
        match self.node_mut(path)? {
            Node::Dir(dir) => Ok(dir),
            Node::File(_) => Err(VfsError::NotADirectory(path.clone())),
        }
    }

    pub(crate) fn file(&self, path: &VfsPath) -> VfsResult<&FileCell> {
        match self.node(path)? {
            Node::File(cell) => Ok(cell),
            Node::Dir(_) => Err(VfsError::NotAFile(path.clone())),
        }
    }

    /// Create any missing directories along `path`. Returns those created.
    pub(crate) fn ensure_dirs(&mut self, path: &VfsPath) -> VfsResult<Vec<VfsPath>> {
        let mut created = Vec::new();
        let mut current = &mut self.root;
        for (depth, segment) in path.segments().iter().enumerate() {
            let Node::Dir(dir) = current else {
                return Err(VfsError::NotADirectory(path.ancestor(depth)));
            };
            if !dir.children.contains_key(segment) {
                dir.children
                    .insert(segment.clone(), Node::Dir(DirNode::new(Origin::Local)));
                dir.touch();
                created.push(path.ancestor(depth + 1));
            }
            current = dir
                .children
                .get_mut(segment)
                .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        }
        match current {
            Node::Dir(_) => Ok(created),
            Node::File(_) => Err(VfsError::NotADirectory(path.clone())),
        }
    }

    /// Remove the node at `path` from its parent and return it.
    pub(crate) fn detach(&mut self, path: &VfsPath) -> VfsResult<Node> {
        let (parent, name) = split(path)?;
        let dir = self.dir_mut(&parent)?;
        let node = dir
            .children
            .remove(name)
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        dir.touch();
        Ok(node)
    }

    /// Insert `node` at `path`. The parent must exist; the name must be free.
    pub(crate) fn attach(&mut self, path: &VfsPath, node: Node) -> VfsResult<()> {
        let (parent, name) = split(path)?;
        let dir = self.dir_mut(&parent)?;
        if dir.children.contains_key(name) {
            return Err(VfsError::AlreadyExists(path.clone()));
        }
        dir.children.insert(name.to_string(), node);
        dir.touch();
        Ok(())
    }
}

/// Parent path and final name of a non-root path.
pub(crate) fn split(path: &VfsPath) -> VfsResult<(VfsPath, &str)> {
    match (path.parent(), path.name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(VfsError::InvalidOperation(
            "operation not allowed on the root".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> VfsPath {
        VfsPath::parse(s).unwrap()
    }

    fn stored(bytes: &[u8]) -> Node {
        Node::File(file_cell(FileState::new(
            Content::Stored(bytes.to_vec()),
            1,
            Origin::Local,
        )))
    }

    #[test]
    fn attach_and_walk() {
        let mut tree = Tree::default();
        tree.attach(&p("/docs"), Node::Dir(DirNode::new(Origin::Local)))
            .unwrap();
        tree.attach(&p("/docs/a.txt"), stored(b"hi")).unwrap();

        assert!(tree.dir(&p("/docs")).is_ok());
        assert!(tree.file(&p("/docs/a.txt")).is_ok());
        assert!(matches!(
            tree.attach(&p("/docs/a.txt"), stored(b"again")),
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn walking_through_a_file_names_it() {
        let mut tree = Tree::default();
        tree.attach(&p("/f"), stored(b"")).unwrap();

        match tree.node(&p("/f/x/y")) {
            Err(VfsError::NotADirectory(at)) => assert_eq!(at, p("/f")),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("walked through a file"),
        }
        assert!(matches!(tree.node(&p("/missing")), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn ensure_dirs_reports_what_it_created() {
        let mut tree = Tree::default();
        tree.ensure_dirs(&p("/a")).unwrap();

        let created = tree.ensure_dirs(&p("/a/b/c")).unwrap();
        assert_eq!(created, vec![p("/a/b"), p("/a/b/c")]);
        assert!(tree.ensure_dirs(&p("/a/b/c")).unwrap().is_empty());
    }

    #[test]
    fn cloned_directories_share_file_cells() {
        let mut dir = DirNode::new(Origin::Provided);
        dir.children.insert("a".into(), stored(b"one"));
        let count = |dir: &DirNode| match dir.children.get("a") {
            Some(Node::File(cell)) => Arc::strong_count(cell),
            _ => 0,
        };

        let mut copy = dir.clone();
        assert_eq!(count(&dir), 2);
        copy.children.remove("a");
        assert_eq!(count(&dir), 1);
    }
}
