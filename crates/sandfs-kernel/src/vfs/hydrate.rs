//! Mounts and hydration.
//!
//! A mount binds a provider to a path. Before an operation touches a path,
//! every directory mount on the way down whose listing this context does not
//! hold is asked for one. Providers run with no lock held. The listing is
//! built into a [`Layer`] and stored under the mount table lock alone: in the
//! mount for `RefreshPolicy::Once`, in the context for
//! `RefreshPolicy::PerContext`. The shared tree is never touched, so one
//! context's re-hydration cannot change what another has seen.
//!
//! A layer is live while its generation matches the mount's. Invalidating,
//! re-registering or moving a mount gives it a new generation.

use std::collections::BTreeMap;
use std::sync::Arc;

use sandfs_types::{Metadata, NodePolicy, VfsError, VfsPath, VfsResult};

use super::tree::{
    Content, DirNode, FileState, Node, Origin, file_cell, lock_file, next_epoch, read_lock, split,
    write_lock,
};
use super::view::{Found, Layer, View};
use super::{AccessContext, VirtualFileSystem};
use crate::provider::{
    ContentProvider, DirectoryProvider, Listing, NodeContext, ProvidedContent, ProvidedNode,
    RefreshPolicy,
};

#[derive(Clone)]
pub(crate) enum MountSource {
    Directory(Arc<dyn DirectoryProvider>),
    File(Arc<dyn ContentProvider>),
}

pub(crate) struct Mount {
    pub source: MountSource,
    /// Registered through the API rather than returned by another provider.
    pub registered: bool,
    pub refresh: RefreshPolicy,
    pub generation: u64,
    /// The listing every context shares, for `RefreshPolicy::Once`.
    pub layer: Option<Layer>,
}

impl Mount {
    fn needs_hydration(&self, ctx: &AccessContext, path: &VfsPath) -> bool {
        let held = match self.refresh {
            RefreshPolicy::Once => self.layer.as_ref().map(|layer| layer.generation),
            RefreshPolicy::PerContext => ctx.layer_generation(path),
        };
        held != Some(self.generation)
    }

    fn live_layer(&self, ctx: &AccessContext, path: &VfsPath) -> Option<Layer> {
        let layer = match self.refresh {
            RefreshPolicy::Once => self.layer.clone(),
            RefreshPolicy::PerContext => ctx.layer(path),
        }?;
        (layer.generation == self.generation).then_some(layer)
    }
}

#[derive(Default)]
pub(crate) struct MountTable {
    mounts: BTreeMap<VfsPath, Mount>,
    next_generation: u64,
}

impl MountTable {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(crate) fn insert(&mut self, path: VfsPath, source: MountSource, registered: bool) {
        let refresh = match &source {
            MountSource::Directory(provider) => provider.refresh(),
            MountSource::File(_) => RefreshPolicy::PerContext,
        };
        let generation = self.generation();
        self.mounts.insert(
            path,
            Mount {
                source,
                registered,
                refresh,
                generation,
                layer: None,
            },
        );
    }

    /// Record a mount returned inside a listing, unless one is already there.
    fn insert_provided(&mut self, path: VfsPath, provider: Arc<dyn DirectoryProvider>) {
        if !self.mounts.contains_key(&path) {
            self.insert(path, MountSource::Directory(provider), false);
        }
    }

    pub(crate) fn get(&self, path: &VfsPath) -> Option<&Mount> {
        self.mounts.get(path)
    }

    pub(crate) fn remove(&mut self, path: &VfsPath) -> Option<Mount> {
        self.mounts.remove(path)
    }

    /// True if a directory mount lies strictly above `path`.
    pub(crate) fn covers(&self, path: &VfsPath) -> bool {
        self.mounts.iter().any(|(at, mount)| {
            matches!(mount.source, MountSource::Directory(_)) && at != path && path.starts_with(at)
        })
    }

    /// Live layers for `ctx`, deepest mount first.
    pub(crate) fn layers_for(&self, ctx: &AccessContext) -> Vec<Layer> {
        let mut layers: Vec<Layer> = self
            .mounts
            .iter()
            .filter(|(_, mount)| matches!(mount.source, MountSource::Directory(_)))
            .filter_map(|(path, mount)| mount.live_layer(ctx, path))
            .collect();
        layers.sort_by(|a, b| b.root.depth().cmp(&a.root.depth()));
        layers
    }

    /// Force the mount at `path` to be consulted again by every context.
    /// Mounts its earlier listings returned are forgotten.
    pub(crate) fn invalidate(&mut self, path: &VfsPath) -> Option<&Mount> {
        let generation = self.generation();
        let mount = self.mounts.get_mut(path)?;
        mount.generation = generation;
        mount.layer = None;
        self.remove_provided_below(path);
        self.mounts.get(path)
    }

    /// Drop the node at `path` from the shared listings.
    pub(crate) fn prune_layers(&mut self, path: &VfsPath) {
        for mount in self.mounts.values_mut() {
            if let Some(pruned) = mount.layer.as_ref().and_then(|layer| layer.without(path)) {
                mount.layer = Some(pruned);
            }
        }
    }

    pub(crate) fn remove_subtree(&mut self, path: &VfsPath) {
        self.mounts.retain(|p, _| !p.starts_with(path));
    }

    /// Drop provider-returned mounts strictly below `path`.
    fn remove_provided_below(&mut self, path: &VfsPath) {
        self.mounts
            .retain(|p, mount| mount.registered || p == path || !p.starts_with(path));
    }

    /// Move mounts under `from` to `to`. Moved mounts are hydrated afresh.
    pub(crate) fn rebase_subtree(&mut self, from: &VfsPath, to: &VfsPath) {
        let keys: Vec<VfsPath> = self
            .mounts
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for key in keys {
            if let (Some(mut mount), Some(new_path)) = (self.mounts.remove(&key), key.rebase(from, to))
            {
                mount.generation = self.generation();
                mount.layer = None;
                self.mounts.insert(new_path, mount);
            }
        }
    }

    /// Keep registered mounts only, each with a fresh generation.
    pub(crate) fn reset_to_registered(&mut self) {
        self.mounts.retain(|_, mount| mount.registered);
        let paths: Vec<VfsPath> = self.mounts.keys().cloned().collect();
        for path in paths {
            self.invalidate(&path);
        }
    }

    pub(crate) fn registered(&self) -> impl Iterator<Item = (&VfsPath, &MountSource)> {
        self.mounts
            .iter()
            .filter(|(_, mount)| mount.registered)
            .map(|(path, mount)| (path, &mount.source))
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &VfsPath> {
        self.mounts.keys()
    }
}

struct Pending {
    path: VfsPath,
    provider: Arc<dyn DirectoryProvider>,
    generation: u64,
    metadata: Metadata,
}

type NestedMounts = Vec<(VfsPath, Arc<dyn DirectoryProvider>)>;

pub(crate) fn provider_error(path: &VfsPath, err: anyhow::Error) -> VfsError {
    tracing::warn!(path = %path, "provider failed: {:#}", err);
    VfsError::Provider {
        path: path.clone(),
        cause: format!("{err:#}"),
    }
}

impl VirtualFileSystem {
    /// Hydrate every directory mount from the root down to `path` that this
    /// context still needs, including mounts returned by earlier providers.
    pub(crate) async fn hydrate(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<()> {
        while let Some(pending) = self.next_pending(ctx, path)? {
            tracing::debug!(mount = %pending.path, context = ctx.id(), "hydrating");
            let node_ctx = NodeContext {
                path: pending.path.clone(),
                metadata: pending.metadata.clone(),
                context_id: ctx.id(),
            };
            let listing = pending
                .provider
                .list(&node_ctx)
                .await
                .map_err(|err| provider_error(&pending.path, err))?;

            let (layer, nested) = build_layer(&pending, listing);
            self.commit_layer(ctx, layer, nested)?;
        }
        Ok(())
    }

    fn next_pending(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<Option<Pending>> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let mounts = read_lock(&self.mounts)?;
        let layers = mounts.layers_for(ctx);
        let view = View::new(&tree, &policies, &layers, ctx.view());

        for ancestor in path.ancestors_and_self() {
            if !view.visible_leaf(&ancestor) {
                return Ok(None);
            }
            let Some(mount) = mounts.get(&ancestor) else {
                continue;
            };
            let MountSource::Directory(provider) = &mount.source else {
                continue;
            };
            if !mount.needs_hydration(ctx, &ancestor) {
                continue;
            }
            // A mount another context's listing returned may not exist here.
            let metadata = match view.resolve(&ancestor) {
                Ok(Found::Dir(dir)) => dir
                    .primary()
                    .map_or_else(Metadata::new, |primary| primary.metadata.clone()),
                _ => return Ok(None),
            };
            return Ok(Some(Pending {
                path: ancestor,
                provider: Arc::clone(provider),
                generation: mount.generation,
                metadata,
            }));
        }
        Ok(None)
    }

    /// Store a listing unless the mount was removed or invalidated while the
    /// provider ran, or a listing of the same generation is already shared.
    fn commit_layer(&self, ctx: &AccessContext, layer: Layer, nested: NestedMounts) -> VfsResult<()> {
        let mut mounts = write_lock(&self.mounts)?;

        let Some(mount) = mounts.mounts.get_mut(&layer.root) else {
            return Ok(());
        };
        if mount.generation != layer.generation {
            return Ok(());
        }
        match mount.refresh {
            RefreshPolicy::Once => {
                if mount
                    .layer
                    .as_ref()
                    .is_some_and(|held| held.generation == layer.generation)
                {
                    return Ok(());
                }
                mount.layer = Some(layer);
            }
            RefreshPolicy::PerContext => ctx.store_layer(layer),
        }
        for (path, provider) in nested {
            mounts.insert_provided(path, provider);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mount registration
    // ═══════════════════════════════════════════════════════════════════════

    /// Mount a directory provider at `path`, creating the directory if needed.
    pub fn mount_directory(
        &self,
        path: &VfsPath,
        provider: impl DirectoryProvider + 'static,
    ) -> VfsResult<()> {
        self.mount_directory_arc(path, Arc::new(provider))
    }

    pub fn mount_directory_arc(
        &self,
        path: &VfsPath,
        provider: Arc<dyn DirectoryProvider>,
    ) -> VfsResult<()> {
        let mut tree = write_lock(&self.tree)?;
        let mut mounts = write_lock(&self.mounts)?;

        match tree.node(path) {
            Ok(Node::Dir(_)) => {}
            Ok(Node::File(_)) => return Err(VfsError::NotADirectory(path.clone())),
            Err(VfsError::NotFound(_)) => {
                tree.ensure_dirs(path)?;
            }
            Err(err) => return Err(err),
        }
        mounts.insert(path.clone(), MountSource::Directory(provider), true);
        tracing::info!(path = %path, "mounted directory provider");
        Ok(())
    }

    /// Mount a dynamic file at `path`. An existing file's content is replaced
    /// by the provider.
    pub fn mount_file(
        &self,
        path: &VfsPath,
        provider: impl ContentProvider + 'static,
    ) -> VfsResult<()> {
        self.mount_file_arc(path, Arc::new(provider))
    }

    pub fn mount_file_arc(&self, path: &VfsPath, provider: Arc<dyn ContentProvider>) -> VfsResult<()> {
        let (parent, _) = split(path)?;
        let mut tree = write_lock(&self.tree)?;
        let mut mounts = write_lock(&self.mounts)?;

        match tree.node(path) {
            Ok(Node::File(cell)) => {
                lock_file(cell)?.content = Content::dynamic(Arc::clone(&provider));
            }
            Ok(Node::Dir(_)) => return Err(VfsError::NotAFile(path.clone())),
            Err(VfsError::NotFound(_)) => {
                tree.ensure_dirs(&parent)?;
                let content = Content::dynamic(Arc::clone(&provider));
                tree.attach(path, Node::File(file_cell(FileState::new(content, 0, Origin::Local))))?;
            }
            Err(err) => return Err(err),
        }
        mounts.insert(path.clone(), MountSource::File(provider), true);
        tracing::info!(path = %path, "mounted content provider");
        Ok(())
    }

    /// Remove the mount at `path` along with the nodes its provider supplied.
    pub fn unmount(&self, path: &VfsPath) -> VfsResult<()> {
        let mut tree = write_lock(&self.tree)?;
        let mut policies = write_lock(&self.policies)?;
        let mut mounts = write_lock(&self.mounts)?;

        let mount = mounts
            .remove(path)
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        match mount.source {
            // Its listings go with the mount.
            MountSource::Directory(_) => mounts.remove_provided_below(path),
            MountSource::File(_) => {
                let dynamic = match tree.file(path) {
                    Ok(cell) => lock_file(cell)?.is_dynamic(),
                    Err(_) => false,
                };
                if dynamic {
                    tree.detach(path)?;
                    policies.remove_subtree(path);
                }
            }
        }
        tracing::info!(path = %path, "unmounted");
        Ok(())
    }

    /// Make every context consult the provider at `path` again.
    pub fn invalidate_mount(&self, path: &VfsPath) -> VfsResult<()> {
        let tree = read_lock(&self.tree)?;
        let mut mounts = write_lock(&self.mounts)?;

        let mount = mounts
            .invalidate(path)
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        if let MountSource::File(_) = mount.source
            && let Ok(cell) = tree.file(path)
            && let Content::Dynamic { epoch, .. } = &mut lock_file(cell)?.content
        {
            *epoch = next_epoch();
        }
        tracing::debug!(path = %path, "invalidated mount");
        Ok(())
    }

    /// Paths with a provider mounted, including nested provided mounts.
    pub fn mount_points(&self) -> VfsResult<Vec<VfsPath>> {
        Ok(read_lock(&self.mounts)?.paths().cloned().collect())
    }
}

fn build_layer(pending: &Pending, listing: Listing) -> (Layer, NestedMounts) {
    let mut policies = BTreeMap::new();
    let mut nested = Vec::new();
    let mut dir = DirNode::new(Origin::Provided);
    dir.metadata = pending.metadata.clone();
    fill(&mut dir, &pending.path, listing, &mut policies, &mut nested);

    let layer = Layer {
        root: pending.path.clone(),
        generation: pending.generation,
        dir: Arc::new(dir),
        policies: Arc::new(policies),
    };
    (layer, nested)
}

fn fill(
    dir: &mut DirNode,
    at: &VfsPath,
    listing: Listing,
    policies: &mut BTreeMap<VfsPath, NodePolicy>,
    nested: &mut NestedMounts,
) {
    for (name, provided) in listing {
        let path = match at.join(&name) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(dir = %at, "provider returned an invalid name: {}", err);
                continue;
            }
        };
        let node = match provided {
            ProvidedNode::File {
                content,
                policy,
                metadata,
            } => {
                let content = match content {
                    ProvidedContent::Static(bytes) => Content::Stored(bytes),
                    ProvidedContent::Dynamic(provider) => Content::dynamic(provider),
                };
                let mut state = FileState::new(content, 0, Origin::Provided);
                state.metadata = metadata;
                if let Some(policy) = policy {
                    policies.insert(path, policy);
                }
                Node::File(file_cell(state))
            }
            ProvidedNode::Directory {
                children,
                provider,
                policy,
                metadata,
            } => {
                let mut child = DirNode::new(Origin::Provided);
                child.metadata = metadata;
                fill(&mut child, &path, children, policies, nested);
                if let Some(policy) = policy {
                    policies.insert(path.clone(), policy);
                }
                if let Some(provider) = provider {
                    nested.push((path, provider));
                }
                Node::Dir(child)
            }
        };
        dir.children.insert(name, node);
    }
}
