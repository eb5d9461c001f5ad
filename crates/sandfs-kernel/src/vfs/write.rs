//! Mutating operations: writes, directories, removal, move and copy.
//!
//! A write to an existing local file holds the tree read lock and the file's
//! own mutex while it checks policy and the expected version, then commits.
//! Creation, structural changes and the first write to a provided file take
//! the tree write lock; the provided file is copied into the shared tree
//! (promoted) and the write lands on the copy. Hooks run after every lock is
//! released.

use std::sync::Arc;
use std::time::SystemTime;

use sandfs_types::{
    NodeKind, NodePolicy, Operation, PathEvent, PathEventKind, VfsError, VfsPath, VfsResult,
    WriteEvent, WriteOutcome,
};

use super::tree::{
    Content, FileCell, FileState, Node, Origin, file_cell, lock_file, read_lock, split, write_lock,
};
use super::view::{Found, View};
use super::{AccessContext, VirtualFileSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Replace,
    Append,
}

impl WriteMode {
    fn operation(self) -> Operation {
        match self {
            WriteMode::Replace => Operation::Write,
            WriteMode::Append => Operation::Append,
        }
    }
}

struct Committed {
    version: u64,
    created: bool,
    /// Full content after the write, kept only when hooks are registered.
    content: Option<Vec<u8>>,
}

enum Attempt {
    Done(Committed),
    /// The write needs the tree write lock.
    Tree(Vec<u8>),
}

/// The version a write expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expected {
    Any,
    /// Compare-and-set. 0 creates and fails on any existing file.
    Version(u64),
    /// An existing file, still at this version.
    Existing(u64),
}

impl From<Option<u64>> for Expected {
    fn from(version: Option<u64>) -> Self {
        version.map_or(Expected::Any, Expected::Version)
    }
}

/// What a write found at its path under the tree write lock.
enum Target {
    Local(FileCell),
    Provided(FileState),
    Missing,
}

enum Touched {
    Done,
    LocalDir,
    Create,
}

/// Compare-and-set against the file's current version, then commit.
///
/// `Expected::Version(0)` fails with `AlreadyExists` on a file nothing has
/// written yet. `base` is the resolved content of a dynamic file being
/// appended to.
fn apply(
    state: &mut FileState,
    path: &VfsPath,
    data: Vec<u8>,
    expected: Expected,
    mode: WriteMode,
    keep_content: bool,
    base: Option<&[u8]>,
) -> VfsResult<Committed> {
    match expected {
        Expected::Version(0) if state.version == 0 => {
            return Err(VfsError::AlreadyExists(path.clone()));
        }
        Expected::Version(expected) | Expected::Existing(expected)
            if expected != state.version =>
        {
            return Err(VfsError::VersionConflict {
                path: path.clone(),
                expected,
                current: state.version,
            });
        }
        _ => {}
    }

    let content = match mode {
        WriteMode::Replace => data,
        WriteMode::Append => {
            let mut buf = match &state.content {
                Content::Stored(bytes) => bytes.clone(),
                Content::Dynamic { .. } => base.map(<[u8]>::to_vec).unwrap_or_default(),
            };
            buf.extend_from_slice(&data);
            buf
        }
    };
    let kept = keep_content.then(|| content.clone());
    state.content = Content::Stored(content);
    state.version += 1;
    state.modified = SystemTime::now();
    state.origin = Origin::Local;

    Ok(Committed {
        version: state.version,
        created: false,
        content: kept,
    })
}

/// The deepest existing ancestor-or-self of `dir` must be a visible,
/// writable directory.
fn check_parent_writable(view: &View<'_>, dir: &VfsPath) -> VfsResult<()> {
    let existing = dir
        .ancestors_and_self()
        .take_while(|p| view.exists(p))
        .last()
        .unwrap_or_default();
    view.dir(&existing)?;
    if !view.visible(&existing) {
        return Err(VfsError::NotFound(dir.clone()));
    }
    view.check(&existing, Operation::Write)
}

/// Check that a node and everything below it may be removed or moved.
fn check_subtree_writable(view: &View<'_>, found: &Found<'_>, at: &VfsPath) -> VfsResult<()> {
    let mut denied = None;
    view.visit(found, at, &mut |path, _| {
        if denied.is_none()
            && let Err(err) = view.check(path, Operation::Write)
        {
            denied = Some(err);
        }
    })?;
    match denied {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn collect_files(view: &View<'_>, found: &Found<'_>, at: &VfsPath) -> VfsResult<Vec<(VfsPath, FileCell)>> {
    let mut files = Vec::new();
    view.visit(found, at, &mut |path, node| {
        if let Found::File { cell, .. } = node {
            files.push((path.clone(), Arc::clone(cell)));
        }
    })?;
    Ok(files)
}

impl VirtualFileSystem {
    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Replace the content of the file at `path`, creating it (and any
    /// missing parent directories) if needed.
    ///
    /// With `expected_version`, the write only commits if the file's current
    /// version matches. `Some(0)` creates: it fails with `AlreadyExists` if a
    /// file that was never written (touched or provided) is already there, and
    /// with a version conflict if a written one is. On success the version is
    /// incremented by exactly one.
    #[tracing::instrument(level = "debug", skip(self, ctx, content), fields(path = %path))]
    pub async fn write_file(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        content: impl Into<Vec<u8>>,
        expected_version: Option<u64>,
    ) -> VfsResult<WriteOutcome> {
        self.commit_write(
            ctx,
            path,
            content.into(),
            expected_version.into(),
            WriteMode::Replace,
        )
        .await
    }

    /// Replace the content of a file with a crate-internal expectation.
    pub(crate) async fn write_file_expecting(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        content: Vec<u8>,
        expected: Expected,
    ) -> VfsResult<WriteOutcome> {
        self.commit_write(ctx, path, content, expected, WriteMode::Replace)
            .await
    }

    /// Append to an existing file. Fails with `NotFound` if it does not exist.
    #[tracing::instrument(level = "debug", skip(self, ctx, content), fields(path = %path))]
    pub async fn append_file(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        content: impl Into<Vec<u8>>,
    ) -> VfsResult<WriteOutcome> {
        self.commit_write(ctx, path, content.into(), Expected::Any, WriteMode::Append)
            .await
    }

    async fn commit_write(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        data: Vec<u8>,
        expected: Expected,
        mode: WriteMode,
    ) -> VfsResult<WriteOutcome> {
        if path.is_root() {
            return Err(VfsError::NotAFile(path.clone()));
        }
        self.hydrate(ctx, path).await?;
        // Appends build on the content this context resolves.
        let base = if mode == WriteMode::Append && self.is_dynamic(ctx, path)? {
            Some(self.read_file(ctx, path).await?.content)
        } else {
            None
        };

        let keep_content = !self.hooks.is_empty();
        let base = base.as_deref();
        let committed = match self.write_existing(ctx, path, data, expected, mode, keep_content, base)? {
            Attempt::Done(committed) => committed,
            Attempt::Tree(data) => {
                self.write_into_tree(ctx, path, data, expected, mode, keep_content, base)?
            }
        };

        tracing::debug!(
            path = %path,
            version = committed.version,
            created = committed.created,
            "write committed"
        );
        Ok(self.dispatch_write(path, committed, mode))
    }

    fn is_dynamic(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<bool> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        match view.resolve(path) {
            Ok(Found::File { cell, .. }) => Ok(lock_file(cell)?.is_dynamic()),
            _ => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_existing(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        data: Vec<u8>,
        expected: Expected,
        mode: WriteMode,
        keep_content: bool,
        base: Option<&[u8]>,
    ) -> VfsResult<Attempt> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        if !view.visible(path) {
            return Err(VfsError::NotFound(path.clone()));
        }
        let cell = match view.resolve(path) {
            Ok(Found::File { cell, local: true }) => cell,
            Ok(Found::File { local: false, .. }) | Err(VfsError::NotFound(_)) => {
                return Ok(Attempt::Tree(data));
            }
            Ok(Found::Dir(_)) => return Err(VfsError::NotAFile(path.clone())),
            Err(err) => return Err(err),
        };
        view.check(path, mode.operation())?;

        let mut state = lock_file(cell)?;
        apply(&mut state, path, data, expected, mode, keep_content, base).map(Attempt::Done)
    }

    /// Create the file, promote a provided one, or write a local file another
    /// writer created since the read-locked attempt.
    #[allow(clippy::too_many_arguments)]
    fn write_into_tree(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        data: Vec<u8>,
        expected: Expected,
        mode: WriteMode,
        keep_content: bool,
        base: Option<&[u8]>,
    ) -> VfsResult<Committed> {
        let (parent, _) = split(path)?;
        let mut tree = write_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;

        let target = {
            let view = View::new(&tree, &policies, &layers, ctx.view());
            if !view.visible(path) {
                return Err(VfsError::NotFound(path.clone()));
            }
            match view.resolve(path) {
                Ok(Found::File { cell, local }) => {
                    view.check(path, mode.operation())?;
                    if local {
                        Target::Local(Arc::clone(cell))
                    } else {
                        Target::Provided(lock_file(cell)?.clone())
                    }
                }
                Ok(Found::Dir(_)) => return Err(VfsError::NotAFile(path.clone())),
                Err(VfsError::NotFound(_)) if mode == WriteMode::Append => {
                    return Err(VfsError::NotFound(path.clone()));
                }
                Err(VfsError::NotFound(_)) => {
                    match expected {
                        Expected::Existing(_) => return Err(VfsError::NotFound(path.clone())),
                        Expected::Version(expected) if expected != 0 => {
                            return Err(VfsError::VersionConflict {
                                path: path.clone(),
                                expected,
                                current: 0,
                            });
                        }
                        _ => {}
                    }
                    check_parent_writable(&view, &parent)?;
                    Target::Missing
                }
                Err(err) => return Err(err),
            }
        };

        match target {
            Target::Local(cell) => {
                let mut state = lock_file(&cell)?;
                apply(&mut state, path, data, expected, mode, keep_content, base)
            }
            Target::Provided(mut state) => {
                let committed = apply(&mut state, path, data, expected, mode, keep_content, base)?;
                tree.ensure_dirs(&parent)?;
                tree.attach(path, Node::File(file_cell(state)))?;
                tracing::debug!(path = %path, "promoted provided file");
                Ok(committed)
            }
            Target::Missing => {
                tree.ensure_dirs(&parent)?;
                let kept = keep_content.then(|| data.clone());
                let state = FileState::new(Content::Stored(data), 1, Origin::Local);
                tree.attach(path, Node::File(file_cell(state)))?;
                Ok(Committed {
                    version: 1,
                    created: true,
                    content: kept,
                })
            }
        }
    }

    fn dispatch_write(&self, path: &VfsPath, committed: Committed, mode: WriteMode) -> WriteOutcome {
        let mut warnings = Vec::new();
        if let Some(content) = committed.content {
            let event = WriteEvent {
                path: path.clone(),
                content,
                version: committed.version,
                timestamp: SystemTime::now(),
                append: mode == WriteMode::Append,
            };
            warnings = self.hooks.dispatch_write(&event);
            self.hooks.dispatch_path(&PathEvent {
                path: path.clone(),
                kind: if committed.created {
                    PathEventKind::Create
                } else {
                    PathEventKind::Update
                },
                content: Some(event.content),
            });
        }
        WriteOutcome {
            path: path.clone(),
            version: committed.version,
            warnings,
        }
    }

    /// Update a node's modification time, creating an empty file (version 0)
    /// if nothing exists at `path`. The parent directory must exist.
    ///
    /// A directory only a provider lists keeps its provided timestamps.
    pub async fn touch(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<()> {
        let (parent, _) = split(path)?;
        self.hydrate(ctx, path).await?;

        let created = {
            let mut tree = write_lock(&self.tree)?;
            let policies = read_lock(&self.policies)?;
            let layers = self.layers(ctx)?;

            let touched = {
                let view = View::new(&tree, &policies, &layers, ctx.view());
                if !view.visible(path) {
                    return Err(VfsError::NotFound(path.clone()));
                }
                match view.resolve(path) {
                    Ok(Found::File { cell, .. }) => {
                        view.check(path, Operation::Append)?;
                        lock_file(cell)?.modified = SystemTime::now();
                        Touched::Done
                    }
                    Ok(Found::Dir(dir)) => {
                        view.check(path, Operation::Write)?;
                        if dir.is_local() {
                            Touched::LocalDir
                        } else {
                            Touched::Done
                        }
                    }
                    Err(VfsError::NotFound(_)) => {
                        view.dir(&parent)?;
                        check_parent_writable(&view, &parent)?;
                        Touched::Create
                    }
                    Err(err) => return Err(err),
                }
            };

            match touched {
                Touched::Done => false,
                Touched::LocalDir => {
                    tree.dir_mut(path)?.touch();
                    false
                }
                Touched::Create => {
                    tree.ensure_dirs(&parent)?;
                    let state = FileState::new(Content::Stored(Vec::new()), 0, Origin::Local);
                    tree.attach(path, Node::File(file_cell(state)))?;
                    true
                }
            }
        };

        if created {
            self.hooks.dispatch_path(&PathEvent {
                path: path.clone(),
                kind: PathEventKind::Create,
                content: Some(Vec::new()),
            });
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Directories and removal
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a directory. With `parents`, missing ancestors are created and
    /// an existing directory is not an error.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(path = %path))]
    pub async fn mkdir(&self, ctx: &AccessContext, path: &VfsPath, parents: bool) -> VfsResult<()> {
        if path.is_root() {
            return if parents {
                Ok(())
            } else {
                Err(VfsError::AlreadyExists(path.clone()))
            };
        }
        self.hydrate(ctx, path).await?;

        let mut tree = write_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        {
            let view = View::new(&tree, &policies, &layers, ctx.view());
            if !view.visible(path) {
                return Err(VfsError::NotFound(path.clone()));
            }
            match view.resolve(path) {
                Ok(Found::Dir(_)) if parents => return Ok(()),
                Ok(_) => return Err(VfsError::AlreadyExists(path.clone())),
                Err(VfsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }

            let (parent, _) = split(path)?;
            if !parents {
                view.dir(&parent)?;
            }
            check_parent_writable(&view, &parent)?;
        }
        let created = tree.ensure_dirs(path)?;
        tracing::debug!(path = %path, created = created.len(), "mkdir");
        Ok(())
    }

    /// Remove a file or directory. Non-empty directories need `recursive`.
    ///
    /// Policies and mounts at or below `path` are dropped with it. A provided
    /// node is dropped from this context's listing, or from the shared one
    /// of a mount hydrated once.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(path = %path))]
    pub async fn remove(&self, ctx: &AccessContext, path: &VfsPath, recursive: bool) -> VfsResult<()> {
        if path.is_root() {
            return Err(VfsError::InvalidOperation("cannot remove the root".into()));
        }
        self.hydrate(ctx, path).await?;
        let deleted = self.remove_locked(ctx, path, recursive, None)?;
        self.dispatch_deletes(deleted);
        Ok(())
    }

    /// Remove a file only if its version is still `expected`.
    pub(crate) fn remove_file_if_version(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        expected: u64,
    ) -> VfsResult<()> {
        let deleted = self.remove_locked(ctx, path, false, Some(expected))?;
        self.dispatch_deletes(deleted);
        Ok(())
    }

    fn remove_locked(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        recursive: bool,
        expected_version: Option<u64>,
    ) -> VfsResult<Vec<VfsPath>> {
        let (parent, _) = split(path)?;
        let mut tree = write_lock(&self.tree)?;
        let mut policies = write_lock(&self.policies)?;
        let mut mounts = write_lock(&self.mounts)?;
        let layers = mounts.layers_for(ctx);

        let deleted: Vec<VfsPath> = {
            let view = View::new(&tree, &policies, &layers, ctx.view());
            if !view.visible(path) {
                return Err(VfsError::NotFound(path.clone()));
            }
            let found = view.resolve(path)?;
            if let Some(expected) = expected_version {
                let Found::File { cell, .. } = &found else {
                    return Err(VfsError::NotAFile(path.clone()));
                };
                let current = lock_file(cell)?.version;
                if current != expected {
                    return Err(VfsError::VersionConflict {
                        path: path.clone(),
                        expected,
                        current,
                    });
                }
            }
            if let Found::Dir(dir) = &found
                && !dir.is_empty()
                && !recursive
            {
                return Err(VfsError::DirectoryNotEmpty(path.clone()));
            }
            view.check(&parent, Operation::Write)?;
            check_subtree_writable(&view, &found, path)?;

            collect_files(&view, &found, path)?
                .into_iter()
                .map(|(file, _)| file)
                .collect()
        };

        match tree.detach(path) {
            Ok(_) | Err(VfsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        ctx.prune_layers(path);
        mounts.prune_layers(path);
        policies.remove_subtree(path);
        mounts.remove_subtree(path);
        tracing::debug!(path = %path, files = deleted.len(), "removed");
        Ok(deleted)
    }

    fn dispatch_deletes(&self, deleted: Vec<VfsPath>) {
        for path in deleted {
            self.hooks.dispatch_path(&PathEvent {
                path,
                kind: PathEventKind::Delete,
                content: None,
            });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Move and copy
    // ═══════════════════════════════════════════════════════════════════════

    /// Move `src` to `dst`. If `dst` is an existing directory the node moves
    /// into it. Returns the node's new path.
    ///
    /// File versions and explicit policies move with the node. Provided
    /// content becomes local at the new path, keeping the provider's
    /// policies as explicit ones.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(src = %src, dst = %dst))]
    pub async fn move_node(
        &self,
        ctx: &AccessContext,
        src: &VfsPath,
        dst: &VfsPath,
    ) -> VfsResult<VfsPath> {
        let (src_parent, src_name) = split(src)?;
        self.hydrate(ctx, src).await?;
        self.hydrate(ctx, dst).await?;

        let (target, moved) = {
            let mut tree = write_lock(&self.tree)?;
            let mut policies = write_lock(&self.policies)?;
            let mut mounts = write_lock(&self.mounts)?;
            let layers = mounts.layers_for(ctx);

            let (target, target_parent, node, carried, moved) = {
                let view = View::new(&tree, &policies, &layers, ctx.view());
                if !view.visible(src) {
                    return Err(VfsError::NotFound(src.clone()));
                }
                let found = view.resolve(src)?;
                check_subtree_writable(&view, &found, src)?;
                view.check(&src_parent, Operation::Write)?;

                let target = match view.resolve(dst) {
                    Ok(Found::Dir(_)) => dst.join(src_name)?,
                    Ok(Found::File { .. }) => return Err(VfsError::AlreadyExists(dst.clone())),
                    Err(VfsError::NotFound(_)) => dst.clone(),
                    Err(err) => return Err(err),
                };
                if target == *src {
                    return Ok(target);
                }
                if target.starts_with(src) {
                    return Err(VfsError::InvalidOperation(format!(
                        "cannot move {src} into itself"
                    )));
                }
                if view.exists(&target) {
                    return Err(VfsError::AlreadyExists(target));
                }
                let (target_parent, _) = split(&target)?;
                view.dir(&target_parent)?;
                if !view.visible(&target_parent) {
                    return Err(VfsError::NotFound(target_parent));
                }
                view.check(&target_parent, Operation::Write)?;

                let mut carried = Vec::new();
                view.visit(&found, src, &mut |path, _| {
                    if let Some(policy) = view.layer_policy(path) {
                        carried.push((path.clone(), policy.clone()));
                    }
                })?;
                let moved = collect_files(&view, &found, src)?;
                let node = view.to_local(&found, src)?;
                (target, target_parent, node, carried, moved)
            };

            tree.ensure_dirs(&target_parent)?;
            match tree.detach(src) {
                Ok(_) | Err(VfsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            ctx.prune_layers(src);
            mounts.prune_layers(src);
            tree.attach(&target, node)?;
            for (path, policy) in carried {
                if policies.explicit(&path).is_none() {
                    policies.set(path, policy);
                }
            }
            policies.rebase_subtree(src, &target);
            mounts.rebase_subtree(src, &target);
            (target, moved)
        };

        tracing::debug!(src = %src, dst = %target, files = moved.len(), "moved");
        if !self.hooks.is_empty() {
            for (old, cell) in moved {
                let content = lock_file(&cell)?.content.bytes().map(<[u8]>::to_vec);
                let Some(new) = old.rebase(src, &target) else {
                    continue;
                };
                self.hooks.dispatch_path(&PathEvent {
                    path: old,
                    kind: PathEventKind::Delete,
                    content: None,
                });
                self.hooks.dispatch_path(&PathEvent {
                    path: new,
                    kind: PathEventKind::Create,
                    content,
                });
            }
        }
        Ok(target)
    }

    /// Copy `src` to `dst`. If `dst` is an existing directory the copy is
    /// placed inside it. Directories need `recursive`.
    ///
    /// Copies go through the normal write path: new files start at version 1
    /// and hooks fire. Explicit policies are copied after the content.
    #[tracing::instrument(level = "debug", skip(self, ctx), fields(src = %src, dst = %dst))]
    pub async fn copy(
        &self,
        ctx: &AccessContext,
        src: &VfsPath,
        dst: &VfsPath,
        recursive: bool,
    ) -> VfsResult<VfsPath> {
        let source = self.lookup(ctx, src).await?;
        let target = match self.lookup(ctx, dst).await {
            Ok(existing) if existing.kind == NodeKind::Directory => {
                let name = src.name().ok_or_else(|| {
                    VfsError::InvalidOperation("cannot copy the root into a directory".into())
                })?;
                dst.join(name)?
            }
            Ok(_) if source.kind == NodeKind::Directory => {
                return Err(VfsError::NotADirectory(dst.clone()));
            }
            Ok(_) | Err(VfsError::NotFound(_)) => dst.clone(),
            Err(err) => return Err(err),
        };

        let mut policies: Vec<(VfsPath, NodePolicy)> = Vec::new();
        match source.kind {
            NodeKind::File => {
                let data = self.read_file(ctx, src).await?;
                self.write_file(ctx, &target, data.content, None).await?;
                if let Some(policy) = self.explicit_policy(ctx, src)? {
                    policies.push((target.clone(), policy));
                }
            }
            NodeKind::Directory => {
                if !recursive {
                    return Err(VfsError::InvalidOperation(format!(
                        "{src} is a directory; copy it recursively"
                    )));
                }
                if target.starts_with(src) {
                    return Err(VfsError::InvalidOperation(format!(
                        "cannot copy {src} into itself"
                    )));
                }
                let entries = self.walk(ctx, src).await?;
                self.mkdir(ctx, &target, true).await?;
                if let Some(policy) = self.explicit_policy(ctx, src)? {
                    policies.push((target.clone(), policy));
                }
                for entry in entries {
                    let Some(dest) = entry.path.rebase(src, &target) else {
                        continue;
                    };
                    if entry.is_dir() {
                        self.mkdir(ctx, &dest, true).await?;
                    } else {
                        let data = self.read_file(ctx, &entry.path).await?;
                        self.write_file(ctx, &dest, data.content, None).await?;
                    }
                    if let Some(policy) = self.explicit_policy(ctx, &entry.path)? {
                        policies.push((dest, policy));
                    }
                }
            }
        }

        for (path, policy) in policies {
            self.set_policy(&path, policy)?;
        }
        Ok(target)
    }

    fn explicit_policy(&self, ctx: &AccessContext, path: &VfsPath) -> VfsResult<Option<NodePolicy>> {
        let tree = read_lock(&self.tree)?;
        let policies = read_lock(&self.policies)?;
        let layers = self.layers(ctx)?;
        let view = View::new(&tree, &policies, &layers, ctx.view());
        Ok(view.explicit(path).cloned())
    }
}
