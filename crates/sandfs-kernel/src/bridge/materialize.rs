//! Copy a sandbox subtree onto the host filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sandfs_types::{NodeKind, VfsError, VfsPath, VfsResult};

use crate::vfs::{AccessContext, VirtualFileSystem};

/// What was written to the host, keyed by sandbox path.
#[derive(Debug, Default)]
pub(crate) struct Manifest {
    pub files: BTreeMap<VfsPath, ManifestEntry>,
}

#[derive(Debug)]
pub(crate) struct ManifestEntry {
    pub version: u64,
    pub content: Vec<u8>,
}

pub(crate) fn host_path(host_root: &Path, root: &VfsPath, path: &VfsPath) -> PathBuf {
    join_host(host_root, path.strip_prefix(root).unwrap_or_default())
}

/// `host_root` with the relative segments appended.
pub(crate) fn join_host(host_root: &Path, rel: &[String]) -> PathBuf {
    let mut out = host_root.to_path_buf();
    out.extend(rel);
    out
}

/// Write every visible, readable file under `root` into `host_root`.
///
/// A file is left out if the context may not read it, or if the closest
/// policy on its ancestor chain makes it unreadable. Provider failures abort.
pub(crate) async fn export_subtree(
    vfs: &VirtualFileSystem,
    ctx: &AccessContext,
    root: &VfsPath,
    host_root: &Path,
) -> VfsResult<Manifest> {
    let mut manifest = Manifest::default();
    tokio::fs::create_dir_all(host_root).await?;

    for entry in vfs.walk(ctx, root).await? {
        let target = host_path(host_root, root, &entry.path);
        match entry.kind {
            NodeKind::Directory => tokio::fs::create_dir_all(&target).await?,
            NodeKind::File => {
                if !vfs.nearest_policy(ctx, &entry.path)?.readable {
                    tracing::debug!(path = %entry.path, "not exported: unreadable");
                    continue;
                }
                let data = match vfs.read_file(ctx, &entry.path).await {
                    Ok(data) => data,
                    Err(VfsError::PermissionDenied { .. } | VfsError::NotFound(_)) => {
                        tracing::debug!(path = %entry.path, "not exported");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, &data.content).await?;
                manifest.files.insert(
                    entry.path,
                    ManifestEntry {
                        version: data.version,
                        content: data.content,
                    },
                );
            }
        }
    }
    Ok(manifest)
}

impl VirtualFileSystem {
    /// Write the subtree at `path` into the host directory `host_dir`,
    /// creating it if needed. Returns the number of files written.
    #[tracing::instrument(level = "debug", skip(self, ctx, host_dir), fields(path = %path))]
    pub async fn export_to_path(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        host_dir: &Path,
    ) -> VfsResult<usize> {
        let manifest = export_subtree(self, ctx, path, host_dir).await?;
        tracing::debug!(path = %path, files = manifest.files.len(), host = %host_dir.display(), "exported");
        Ok(manifest.files.len())
    }
}
