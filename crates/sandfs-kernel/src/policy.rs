//! Policy table: explicit per-path policies plus the sandbox default.
//!
//! This is the shared table that `set_policy` writes. Checks against it, and
//! against policies supplied by providers, go through a context's view.

use std::collections::BTreeMap;

use sandfs_types::{NodePolicy, VfsPath};

#[derive(Debug, Clone)]
pub(crate) struct PolicyTable {
    default: NodePolicy,
    entries: BTreeMap<VfsPath, NodePolicy>,
}

impl PolicyTable {
    pub(crate) fn new(default: NodePolicy) -> Self {
        Self {
            default,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn default_policy(&self) -> &NodePolicy {
        &self.default
    }

    /// Policy in force for `path`: explicit entry or the default.
    pub(crate) fn effective(&self, path: &VfsPath) -> &NodePolicy {
        self.entries.get(path).unwrap_or(&self.default)
    }

    pub(crate) fn explicit(&self, path: &VfsPath) -> Option<&NodePolicy> {
        self.entries.get(path)
    }

    pub(crate) fn set(&mut self, path: VfsPath, policy: NodePolicy) {
        self.entries.insert(path, policy);
    }

    /// Drop every entry at or below `path`.
    pub(crate) fn remove_subtree(&mut self, path: &VfsPath) {
        self.entries.retain(|p, _| !p.starts_with(path));
    }

    /// Move every entry at or below `from` under `to`.
    pub(crate) fn rebase_subtree(&mut self, from: &VfsPath, to: &VfsPath) {
        let moved: Vec<(VfsPath, NodePolicy)> = self
            .entries
            .iter()
            .filter_map(|(p, policy)| p.rebase(from, to).map(|np| (np, policy.clone())))
            .collect();
        if moved.is_empty() {
            return;
        }
        self.remove_subtree(from);
        self.remove_subtree(to);
        self.entries.extend(moved);
    }
}
