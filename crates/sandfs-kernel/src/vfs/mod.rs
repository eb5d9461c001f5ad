//! The sandbox filesystem.
//!
//! [`VirtualFileSystem`] holds one tree of directories and files, the policy
//! table, the mount table of providers, and the registered hooks. Every
//! operation takes an [`AccessContext`]; nodes the context's view cannot see
//! behave as absent, and mounts are hydrated on the context's first visit.
//! Reads resolve through a `View`: the shared tree overlaid with the
//! provider listings the context holds.
//!
//! Read operations live here; mutations are in `write`, provider plumbing in
//! `hydrate`.

mod context;
mod hydrate;
mod tree;
mod view;
mod write;

pub use context::AccessContext;

pub(crate) use hydrate::{MountSource, MountTable};
pub(crate) use tree::{
    Content, DirNode, FileState, Node, Origin, Tree, file_cell, lock_file, read_lock,
    write_lock,
};
pub(crate) use view::{Found, Layer, View};
pub(crate) use write::Expected;

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use sandfs_types::{
    DirEntry, FileData, NodeKind, NodePolicy, NodeStat, Operation, PathEvent, VfsError, VfsPath,
    VfsResult, VisibilityView, WriteEvent,
};

use crate::config::SandboxConfig;
use crate::hooks::{HookRegistry, PathHook, WriteHook};
use crate::policy::PolicyTable;
use crate::provider::NodeContext;

/// An in-memory sandboxed filesystem.
///
/// Thread-safe: share it behind an `Arc` and give each agent its own
/// [`AccessContext`].
pub struct VirtualFileSystem {
    pub(crate) config: SandboxConfig,
    pub(crate) tree: RwLock<Tree>,
    pub(crate) policies: RwLock<PolicyTable>,
    pub(crate) mounts: RwLock<MountTable>,
    pub(crate) hooks: HookRegistry,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem")
            .field("root_label", &self.config.root_label)
            .finish_non_exhaustive()
    }
}

impl VirtualFileSystem {
    /// Create an empty sandbox with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SandboxConfig::default())
    }

    pub fn with_config(config: SandboxConfig) -> Self {
        let policies = PolicyTable::new(config.effective_default_policy());
        Self {
            config,
            tree: RwLock::new(Tree::default()),
            policies: RwLock::new(policies),
            mounts: RwLock::new(MountTable::default()),
            hooks: HookRegistry::default(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// A fresh context with an unrestricted view.
    pub fn context(&self) -> AccessContext {
        AccessContext::unrestricted()
    }

    /// A fresh context restricted to `view`.
    pub fn context_with_view(&self, view: VisibilityView) -> AccessContext {
        AccessContext::new(view)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    /// Live provider layers for `ctx`. Takes the mounts lock, so callers may
    /// hold the tree and policy locks but not a file.
    fn layers(&self, ctx: &AccessContext) -> VfsResult<Vec<Layer>> {
        Ok(read_lock(&self.mounts)?.layers_for(ctx))
    }

    /// Metadata for the node at `path`.
    #[tracing::instrument(level = "trace", skip(self, ctx), fields(path = %path))]
    pub async fn lookup(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<NodeStat> {
        self.hydrate(ctx, path).await?;

        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        if !view.visible(path) {
            return Err(VfsError::NotFound(path.clone()));
        }
        let found = view.resolve(path)?;
        stat_found(ctx, &view, &found, path)
    }

    /// Alias for [`lookup`](Self::lookup).
    pub async fn stat(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<NodeStat> {
        self.lookup(ctx, path).await
    }

    pub async fn exists(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<bool> {
        match self.lookup(ctx, path).await {
            Ok(_) => Ok(true),
            Err(VfsError::NotFound(_) | VfsError::NotADirectory(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn is_dir(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<bool> {
        self.is_kind(ctx, path, NodeKind::Directory).await
    }

    pub async fn is_file(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<bool> {
        self.is_kind(ctx, path, NodeKind::File).await
    }

    async fn is_kind(&self, ctx: &AccessContext, path: &VfsPath, kind: NodeKind) -> VfsResult<bool> {
        match self.lookup(ctx, path).await {
            Ok(stat) => Ok(stat.kind == kind),
            Err(VfsError::NotFound(_) | VfsError::NotADirectory(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Current version of the file at `path`.
    pub async fn get_version(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<u64> {
        let stat = self.lookup(ctx, path).await?;
        match stat.kind {
            NodeKind::File => Ok(stat.version),
            NodeKind::Directory => Err(VfsError::NotAFile(path.clone())),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Listing and reading
    // ═══════════════════════════════════════════════════════════════════════

    /// Children of the directory at `path`, sorted by name.
    ///
    /// Children hidden from the context's view are omitted.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(path = %path))]
    pub async fn list_dir(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<Vec<DirEntry>> {
        self.hydrate(ctx, path).await?;

        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        if !view.visible(path) {
            return Err(VfsError::NotFound(path.clone()));
        }
        let dir = view.dir(path)?;
        view.check(path, Operation::List)?;

        let mut entries = Vec::new();
        for (name, child) in view.children(&dir, path)? {
            let child_path = path.join(&name)?;
            if !view.visible_leaf(&child_path) {
                continue;
            }
            let policy = view.policy(&child_path).clone();
            let entry = match &child {
                Found::Dir(d) => DirEntry {
                    name,
                    path: child_path,
                    kind: NodeKind::Directory,
                    size: 0,
                    version: 0,
                    modified: d.primary().map_or(SystemTime::UNIX_EPOCH, |p| p.modified),
                    policy,
                },
                Found::File { cell, .. } => {
                    let (version, modified, content) = {
                        let state = lock_file(cell)?;
                        (state.version, state.modified, state.content.clone())
                    };
                    DirEntry {
                        size: content_size(ctx, &child_path, &content),
                        name,
                        path: child_path,
                        kind: NodeKind::File,
                        version,
                        modified,
                        policy,
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Content and version of the file at `path`.
    ///
    /// Dynamic files are resolved through their provider once per context.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(path = %path))]
    pub async fn read_file(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<FileData> {
        self.hydrate(ctx, path).await?;

        let cell = {
            let tree = read_lock(&self.tree)?;
            let policies = read_lock(&self.policies)?;
            let layers = self.layers(ctx)?;
            let view = View::new(&tree, &policies, &layers, ctx.view());
            if !view.visible(path) {
                return Err(VfsError::NotFound(path.clone()));
            }
            let cell = match view.resolve(path)? {
                Found::File { cell, .. } => Arc::clone(cell),
                Found::Dir(_) => return Err(VfsError::NotAFile(path.clone())),
            };
            view.check(path, Operation::Read)?;
            cell
        };

        let (provider, epoch, version, metadata) = {
            let state = lock_file(&cell)?;
            match &state.content {
                Content::Stored(bytes) => {
                    return Ok(FileData {
                        content: bytes.clone(),
                        version: state.version,
                    });
                }
                Content::Dynamic { provider, epoch } => (
                    Arc::clone(provider),
                    *epoch,
                    state.version,
                    state.metadata.clone(),
                ),
            }
        };
        if let Some(content) = ctx.resolved(path, epoch) {
            return Ok(FileData { content, version });
        }

        let node_ctx = NodeContext {
            path: path.clone(),
            metadata,
            context_id: ctx.id(),
        };
        let bytes = provider
            .content(&node_ctx)
            .await
            .map_err(|err| hydrate::provider_error(path, err))?;
        ctx.store_resolved(path, epoch, bytes.clone());

        let state = lock_file(&cell)?;
        match &state.content {
            // Overwritten while the provider ran.
            Content::Stored(current) => Ok(FileData {
                content: current.clone(),
                version: state.version,
            }),
            Content::Dynamic { .. } => Ok(FileData {
                content: bytes,
                version: state.version,
            }),
        }
    }

    /// Every node below `path`, parents before children.
    ///
    /// Directories the context cannot list are reported but not descended.
    pub async fn walk(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut pending = vec![path.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match self.list_dir(ctx, &dir).await {
                Ok(entries) => entries,
                Err(VfsError::PermissionDenied { .. }) if dir != *path => continue,
                Err(err) => return Err(err),
            };
            for entry in entries {
                if entry.is_dir() {
                    pending.push(entry.path.clone());
                }
                out.push(entry);
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Policies
    // ═══════════════════════════════════════════════════════════════════════

    /// Attach an explicit policy to a node.
    ///
    /// The node must exist in the shared tree or lie under a directory mount,
    /// where it may only exist in a provider's listing. An explicit policy
    /// wins over one the provider supplies.
    pub fn set_policy(&self, path: &VfsPath, policy: NodePolicy) -> VfsResult<()> {
        let tree = read_lock(&self.tree)?;
        let mut policies = write_lock(&self.policies)?;
        let mounts = read_lock(&self.mounts)?;
        if let Err(err) = tree.node(path)
            && !mounts.covers(path)
        {
            return Err(err);
        }
        tracing::debug!(path = %path, ?policy, "set policy");
        policies.set(path.clone(), policy);
        Ok(())
    }

    /// Policy set for a node through [`set_policy`](Self::set_policy), or
    /// the default. Policies providers supply are reported by
    /// [`lookup`](Self::lookup), which sees the context's listings.
    pub fn get_policy(&self, path: &VfsPath) -> VfsResult<NodePolicy> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let mounts = read_lock(&self.mounts)?;
        if let Err(err) = tree.node(path)
            && !mounts.covers(path)
        {
            return Err(err);
        }
        Ok(policies.effective(path).clone())
    }

    /// Closest explicit policy on `path` or an ancestor as `ctx` sees it,
    /// including policies from providers, or the default. `path` itself need
    /// not exist.
    pub fn nearest_policy(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<NodePolicy> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        Ok(view.nearest(path).clone())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Hooks
    // ═══════════════════════════════════════════════════════════════════════

    /// Call `hook` after every committed write or append under `prefix`.
    pub fn register_write_hook<F>(&self, prefix: VfsPath, hook: F)
    where
        F: Fn(&WriteEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_write_hook_arc(prefix, Arc::new(hook));
    }

    pub fn register_write_hook_arc(&self, prefix: VfsPath, hook: Arc<dyn WriteHook>) {
        tracing::debug!(prefix = %prefix, "registered write hook");
        self.hooks.add_write(prefix, hook);
    }

    /// Call `hook` when a file under `prefix` is created, updated or deleted.
    pub fn register_path_hook<F>(&self, prefix: VfsPath, hook: F)
    where
        F: Fn(&PathEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_path_hook_arc(prefix, Arc::new(hook));
    }

    pub fn register_path_hook_arc(&self, prefix: VfsPath, hook: Arc<dyn PathHook>) {
        tracing::debug!(prefix = %prefix, "registered path hook");
        self.hooks.add_path(prefix, hook);
    }
}

/// Byte length of `content` as `ctx` sees it. Dynamic content counts once
/// the context has resolved it.
fn content_size(ctx: &AccessContext, path: &VfsPath, content: &Content) -> u64 {
    match content {
        Content::Stored(bytes) => bytes.len() as u64,
        Content::Dynamic { epoch, .. } => ctx.resolved_len(path, *epoch).unwrap_or(0),
    }
}

fn stat_found(
    ctx: &AccessContext,
    view: &View<'_>,
    found: &Found<'_>,
    path: &VfsPath,
) -> VfsResult<NodeStat> {
    let policy = view.policy(path).clone();
    Ok(match found {
        Found::Dir(dir) => {
            let primary = dir
                .primary()
                .ok_or_else(|| VfsError::NotFound(path.clone()))?;
            NodeStat {
                path: path.clone(),
                kind: NodeKind::Directory,
                size: 0,
                version: 0,
                created: primary.created,
                modified: primary.modified,
                policy,
                provided: primary.origin == Origin::Provided,
                metadata: primary.metadata.clone(),
            }
        }
        Found::File { cell, .. } => {
            let state = lock_file(cell)?.clone();
            NodeStat {
                path: path.clone(),
                kind: NodeKind::File,
                size: content_size(ctx, path, &state.content),
                version: state.version,
                created: state.created,
                modified: state.modified,
                policy,
                provided: state.origin == Origin::Provided,
                metadata: state.metadata,
            }
        }
    })
}
