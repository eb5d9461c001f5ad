//! What one context sees: the shared tree overlaid with provider layers.
//!
//! Provider output never enters the shared tree. Each hydration of a
//! directory mount produces a [`Layer`], an immutable directory rooted at the
//! mount path. Per-context mounts keep their layers in the
//! [`AccessContext`](super::AccessContext), so another context hydrating the
//! same mount cannot change what this one has already seen; `Once` mounts
//! keep a single layer in the mount table.
//!
//! A lookup considers the local node first, then layer nodes from the
//! deepest mount up. The first match decides the kind. A local file shadows
//! anything provided under the same name, and directories of the same name
//! are merged.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sandfs_types::{NodePolicy, Operation, VfsError, VfsPath, VfsResult, VisibilityView};

use super::tree::{DirNode, FileCell, Node, Origin, Tree, file_cell, lock_file};
use crate::policy::PolicyTable;

/// One hydration of a directory mount.
#[derive(Clone)]
pub(crate) struct Layer {
    pub root: VfsPath,
    /// Generation of the mount this listing was taken at.
    pub generation: u64,
    pub dir: Arc<DirNode>,
    /// Policies supplied with the listing.
    pub policies: Arc<BTreeMap<VfsPath, NodePolicy>>,
}

impl Layer {
    /// A copy of this layer without the node at `path`, or `None` if the
    /// layer does not hold it.
    pub(crate) fn without(&self, path: &VfsPath) -> Option<Layer> {
        let rel = path.strip_prefix(&self.root)?;
        let (last, parents) = rel.split_last()?;

        let mut probe: &DirNode = &self.dir;
        for name in parents {
            match probe.children.get(name) {
                Some(Node::Dir(dir)) => probe = dir,
                _ => return None,
            }
        }
        if !probe.children.contains_key(last) {
            return None;
        }

        let mut layer = self.clone();
        let mut dir = Arc::make_mut(&mut layer.dir);
        for name in parents {
            dir = match dir.children.get_mut(name) {
                Some(Node::Dir(child)) => child,
                _ => return None,
            };
        }
        dir.children.remove(last);
        Arc::make_mut(&mut layer.policies).retain(|p, _| !p.starts_with(path));
        Some(layer)
    }
}

/// A node as seen through a view.
#[derive(Clone)]
pub(crate) enum Found<'a> {
    File { cell: &'a FileCell, local: bool },
    Dir(Merged<'a>),
}

/// The directories that make up one path, highest priority first.
#[derive(Clone)]
pub(crate) struct Merged<'a> {
    parts: Vec<(&'a DirNode, bool)>,
}

impl<'a> Merged<'a> {
    /// The directory whose timestamps and metadata represent the merge.
    pub(crate) fn primary(&self) -> Option<&'a DirNode> {
        self.parts.first().map(|(dir, _)| *dir)
    }

    /// True if the shared tree holds this directory.
    pub(crate) fn is_local(&self) -> bool {
        self.parts.first().is_some_and(|(_, local)| *local)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.parts.iter().all(|(dir, _)| dir.children.is_empty())
    }

    fn names(&self) -> BTreeSet<&'a str> {
        self.parts
            .iter()
            .flat_map(|&(dir, _)| dir.children.keys().map(String::as_str))
            .collect()
    }
}

pub(crate) struct View<'a> {
    tree: &'a Tree,
    policies: &'a PolicyTable,
    /// Deepest root first.
    layers: &'a [Layer],
    visibility: &'a VisibilityView,
}

impl<'a> View<'a> {
    pub(crate) fn new(
        tree: &'a Tree,
        policies: &'a PolicyTable,
        layers: &'a [Layer],
        visibility: &'a VisibilityView,
    ) -> Self {
        Self {
            tree,
            policies,
            layers,
            visibility,
        }
    }

    fn root(&self) -> Merged<'a> {
        let mut parts = Vec::new();
        if let Node::Dir(dir) = self.tree.root() {
            parts.push((dir, true));
        }
        let root = VfsPath::root();
        parts.extend(
            self.layers
                .iter()
                .filter(|layer| layer.root == root)
                .map(|layer| (&*layer.dir, false)),
        );
        Merged { parts }
    }

    /// The child `name` of the merged directory at `at`.
    pub(crate) fn child(
        &self,
        dir: &Merged<'a>,
        at: &VfsPath,
        name: &str,
    ) -> VfsResult<Option<Found<'a>>> {
        let mut file = None;
        let mut dirs = Vec::new();
        for &(parent, local) in &dir.parts {
            match parent.children.get(name) {
                Some(Node::File(cell)) if dirs.is_empty() && file.is_none() => {
                    file = Some(Found::File { cell, local });
                }
                Some(Node::Dir(child)) if file.is_none() => dirs.push((child, local)),
                _ => {}
            }
        }
        if file.is_some() {
            return Ok(file);
        }
        if dirs.is_empty() {
            return Ok(None);
        }

        let path = at.join(name)?;
        let after_local = dirs.iter().take_while(|(_, local)| *local).count();
        for layer in self.layers.iter().filter(|layer| layer.root == path) {
            dirs.insert(after_local, (&*layer.dir, false));
        }
        Ok(Some(Found::Dir(Merged { parts: dirs })))
    }

    pub(crate) fn resolve(&self, path: &VfsPath) -> VfsResult<Found<'a>> {
        let mut current = Found::Dir(self.root());
        for (depth, name) in path.segments().iter().enumerate() {
            let at = path.ancestor(depth);
            let Found::Dir(dir) = current else {
                return Err(VfsError::NotADirectory(at));
            };
            current = self
                .child(&dir, &at, name)?
                .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        }
        Ok(current)
    }

    pub(crate) fn exists(&self, path: &VfsPath) -> bool {
        self.resolve(path).is_ok()
    }

    pub(crate) fn dir(&self, path: &VfsPath) -> VfsResult<Merged<'a>> {
        match self.resolve(path)? {
            Found::Dir(dir) => Ok(dir),
            Found::File { .. } => Err(VfsError::NotADirectory(path.clone())),
        }
    }

    /// Children of a merged directory, sorted by name.
    pub(crate) fn children(
        &self,
        dir: &Merged<'a>,
        at: &VfsPath,
    ) -> VfsResult<Vec<(String, Found<'a>)>> {
        let mut out = Vec::new();
        for name in dir.names() {
            if let Some(found) = self.child(dir, at, name)? {
                out.push((name.to_string(), found));
            }
        }
        Ok(out)
    }

    /// Call `f` on `found` and everything below it, parents first.
    pub(crate) fn visit(
        &self,
        found: &Found<'a>,
        at: &VfsPath,
        f: &mut impl FnMut(&VfsPath, &Found<'a>),
    ) -> VfsResult<()> {
        f(at, found);
        if let Found::Dir(dir) = found {
            for (name, child) in self.children(dir, at)? {
                self.visit(&child, &at.join(&name)?, &mut *f)?;
            }
        }
        Ok(())
    }

    /// An owned, locally owned copy of `found` for the shared tree. Local
    /// files keep their identity; provided files are copied.
    pub(crate) fn to_local(&self, found: &Found<'a>, at: &VfsPath) -> VfsResult<Node> {
        match found {
            Found::File { cell, local: true } => Ok(Node::File(Arc::clone(cell))),
            Found::File { cell, local: false } => {
                let mut state = lock_file(cell)?.clone();
                state.origin = Origin::Local;
                Ok(Node::File(file_cell(state)))
            }
            Found::Dir(dir) => {
                let mut out = DirNode::new(Origin::Local);
                if let Some(primary) = dir.primary() {
                    out.created = primary.created;
                    out.modified = primary.modified;
                    out.metadata = primary.metadata.clone();
                }
                for (name, child) in self.children(dir, at)? {
                    let node = self.to_local(&child, &at.join(&name)?)?;
                    out.children.insert(name, node);
                }
                Ok(Node::Dir(out))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Policies
    // ═══════════════════════════════════════════════════════════════════════

    /// Policy a provider attached to `path`, if any.
    pub(crate) fn layer_policy(&self, path: &VfsPath) -> Option<&'a NodePolicy> {
        self.layers
            .iter()
            .find_map(|layer| layer.policies.get(path))
    }

    /// Explicit policy for `path`: the shared table's, else a provider's.
    pub(crate) fn explicit(&self, path: &VfsPath) -> Option<&'a NodePolicy> {
        self.policies
            .explicit(path)
            .or_else(|| self.layer_policy(path))
    }

    /// Policy in force for `path`. An entry set through the API wins over
    /// one supplied by a provider.
    pub(crate) fn policy(&self, path: &VfsPath) -> &'a NodePolicy {
        self.explicit(path)
            .unwrap_or_else(|| self.policies.default_policy())
    }

    /// Closest explicit policy on `path` or an ancestor, else the default.
    pub(crate) fn nearest(&self, path: &VfsPath) -> &'a NodePolicy {
        let chain: Vec<VfsPath> = path.ancestors_and_self().collect();
        chain
            .iter()
            .rev()
            .find_map(|p| self.explicit(p))
            .unwrap_or_else(|| self.policies.default_policy())
    }

    pub(crate) fn check(&self, path: &VfsPath, op: Operation) -> VfsResult<()> {
        self.policy(path)
            .check(op)
            .map_err(|reason| VfsError::denied(path, reason))
    }

    /// True if `path` and all its ancestors pass the view.
    pub(crate) fn visible(&self, path: &VfsPath) -> bool {
        if self.visibility.is_unrestricted() {
            return true;
        }
        path.ancestors_and_self()
            .all(|p| self.visibility.allows(self.policy(&p)))
    }

    /// Visibility of a single node whose ancestors are already known visible.
    pub(crate) fn visible_leaf(&self, path: &VfsPath) -> bool {
        self.visibility.is_unrestricted() || self.visibility.allows(self.policy(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::tree::{Content, FileState};

    fn p(s: &str) -> VfsPath {
        VfsPath::parse(s).unwrap()
    }

    fn file(text: &str, origin: Origin) -> Node {
        Node::File(file_cell(FileState::new(
            Content::Stored(text.as_bytes().to_vec()),
            1,
            origin,
        )))
    }

    fn text(found: &Found<'_>) -> String {
        match found {
            Found::File { cell, .. } => {
                let state = lock_file(cell).unwrap();
                String::from_utf8_lossy(state.content.bytes().unwrap()).into_owned()
            }
            Found::Dir(_) => panic!("directory"),
        }
    }

    /// `/m` holds a local `mine.txt` and a local `shared/` with `a.txt`.
    fn local_tree() -> Tree {
        let mut tree = Tree::default();
        tree.ensure_dirs(&p("/m/shared")).unwrap();
        tree.attach(&p("/m/mine.txt"), file("local", Origin::Local)).unwrap();
        tree.attach(&p("/m/shared/a.txt"), file("local a", Origin::Local))
            .unwrap();
        tree
    }

    /// A layer at `/m` providing `mine.txt`, `feed.txt` and `shared/b.txt`.
    fn layer(generation: u64) -> Layer {
        let mut shared = DirNode::new(Origin::Provided);
        shared
            .children
            .insert("b.txt".into(), file("provided b", Origin::Provided));
        let mut dir = DirNode::new(Origin::Provided);
        dir.children
            .insert("mine.txt".into(), file("provided", Origin::Provided));
        dir.children
            .insert("feed.txt".into(), file("feed", Origin::Provided));
        dir.children.insert("shared".into(), Node::Dir(shared));

        let mut policies = BTreeMap::new();
        policies.insert(
            p("/m/feed.txt"),
            NodePolicy::read_only().with_visibility("private"),
        );
        Layer {
            root: p("/m"),
            generation,
            dir: Arc::new(dir),
            policies: Arc::new(policies),
        }
    }

    #[test]
    fn local_nodes_shadow_and_directories_merge() {
        let tree = local_tree();
        let policies = PolicyTable::new(NodePolicy::default());
        let layers = vec![layer(1)];
        let all = VisibilityView::unrestricted();
        let view = View::new(&tree, &policies, &layers, &all);

        assert_eq!(text(&view.resolve(&p("/m/mine.txt")).unwrap()), "local");
        assert_eq!(text(&view.resolve(&p("/m/feed.txt")).unwrap()), "feed");

        let shared = view.dir(&p("/m/shared")).unwrap();
        assert!(shared.is_local());
        let names: Vec<String> = view
            .children(&shared, &p("/m/shared"))
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(matches!(
            view.resolve(&p("/m/feed.txt/x")),
            Err(VfsError::NotADirectory(at)) if at == p("/m/feed.txt")
        ));
    }

    #[test]
    fn layer_policies_apply_unless_set_explicitly() {
        let tree = local_tree();
        let mut policies = PolicyTable::new(NodePolicy::default());
        let layers = vec![layer(1)];
        let public = VisibilityView::only(["public"]);

        {
            let view = View::new(&tree, &policies, &layers, &public);
            assert!(!view.visible(&p("/m/feed.txt")));
            assert!(view.visible(&p("/m/mine.txt")));
        }

        policies.set(p("/m/feed.txt"), NodePolicy::default());
        let view = View::new(&tree, &policies, &layers, &public);
        assert!(view.visible(&p("/m/feed.txt")));
        assert!(view.check(&p("/m/feed.txt"), Operation::Write).is_ok());
    }

    #[test]
    fn hidden_ancestor_hides_descendants() {
        let tree = local_tree();
        let mut policies = PolicyTable::new(NodePolicy::default());
        policies.set(p("/m"), NodePolicy::default().with_visibility("private"));
        let public = VisibilityView::only(["public"]);
        let view = View::new(&tree, &policies, &[], &public);

        assert!(!view.visible(&p("/m")));
        assert!(!view.visible(&p("/m/shared/a.txt")));
        assert!(view.visible(&p("/other")));
        assert!(view.visible_leaf(&p("/m/shared")));
    }

    #[test]
    fn exact_path_governs_access_and_nearest_walks_up() {
        let tree = local_tree();
        let mut policies = PolicyTable::new(NodePolicy::default());
        policies.set(p("/m"), NodePolicy::default().unreadable());
        let all = VisibilityView::unrestricted();
        let view = View::new(&tree, &policies, &[], &all);

        assert!(view.check(&p("/m"), Operation::Read).is_err());
        assert!(view.check(&p("/m/mine.txt"), Operation::Read).is_ok());
        assert!(!view.nearest(&p("/m/mine.txt")).readable);
        assert!(view.nearest(&p("/elsewhere")).readable);
    }

    #[test]
    fn without_copies_and_leaves_the_original() {
        let original = layer(1);
        let trimmed = original.without(&p("/m/shared/b.txt")).unwrap();

        let mut tree = Tree::default();
        tree.ensure_dirs(&p("/m")).unwrap();
        let policies = PolicyTable::new(NodePolicy::default());
        let all = VisibilityView::unrestricted();
        let before = [original.clone()];
        let after = [trimmed];
        let old = View::new(&tree, &policies, &before, &all);
        let new = View::new(&tree, &policies, &after, &all);

        assert!(old.exists(&p("/m/shared/b.txt")));
        assert!(!new.exists(&p("/m/shared/b.txt")));
        assert!(new.exists(&p("/m/shared")));

        assert!(original.without(&p("/m/nothing")).is_none());
        assert!(original.without(&p("/elsewhere/x")).is_none());
        let no_feed = original.without(&p("/m/feed.txt")).unwrap();
        assert!(no_feed.policies.is_empty());
    }
}
