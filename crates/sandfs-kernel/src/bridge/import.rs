//! Import host-side changes back into the sandbox.
//!
//! Every file under the host directory is compared with the manifest taken
//! at materialization. Changed files are written with the manifest version
//! as the expected version, so anything modified inside the sandbox while
//! the command ran wins and the import of that file is rejected. Files with
//! no manifest entry are created with expected version 0, which never
//! replaces an existing file: one the export skipped, such as an unreadable
//! file, stays as it is and the import is rejected. Files deleted on the host
//! are removed only if their sandbox version is still the one exported.

use std::collections::BTreeSet;
use std::path::Path;

use sandfs_types::{VfsError, VfsPath};

use super::materialize::Manifest;
use super::{ImportOutcome, ImportStatus};
use crate::vfs::{AccessContext, Expected, VirtualFileSystem};

/// Files and directories found under the host root.
#[derive(Debug, Default)]
struct HostTree {
    files: Vec<(VfsPath, std::path::PathBuf)>,
    dirs: Vec<VfsPath>,
}

async fn scan(host_root: &Path, root: &VfsPath) -> std::io::Result<HostTree> {
    let mut tree = HostTree::default();
    let mut pending = vec![(host_root.to_path_buf(), root.clone())];

    while let Some((dir, at)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 name");
                continue;
            };
            let Ok(path) = at.join(name) else {
                tracing::warn!(name, "skipping name not valid in the sandbox");
                continue;
            };
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                tree.dirs.push(path.clone());
                pending.push((entry.path(), path));
            } else if file_type.is_file() {
                tree.files.push((path, entry.path()));
            } else {
                tracing::debug!(path = %entry.path().display(), "skipping special file");
            }
        }
    }
    tree.dirs.sort();
    tree.files.sort();
    Ok(tree)
}

pub(crate) async fn import_changes(
    vfs: &VirtualFileSystem,
    ctx: &AccessContext,
    root: &VfsPath,
    host_root: &Path,
    manifest: &Manifest,
) -> Vec<ImportOutcome> {
    let mut outcomes = Vec::new();
    let host = match scan(host_root, root).await {
        Ok(host) => host,
        Err(err) => {
            tracing::warn!(root = %root, "cannot scan host directory: {}", err);
            outcomes.push(ImportOutcome {
                path: root.clone(),
                status: ImportStatus::Rejected(VfsError::from(err)),
            });
            return outcomes;
        }
    };

    for dir in &host.dirs {
        if let Ok(true) = vfs.is_dir(ctx, dir).await {
            continue;
        }
        if let Err(err) = vfs.mkdir(ctx, dir, true).await {
            outcomes.push(ImportOutcome {
                path: dir.clone(),
                status: ImportStatus::Rejected(err),
            });
        }
    }

    let mut seen = BTreeSet::new();
    for (path, host_file) in &host.files {
        seen.insert(path.clone());
        let content = match tokio::fs::read(host_file).await {
            Ok(content) => content,
            Err(err) => {
                outcomes.push(ImportOutcome {
                    path: path.clone(),
                    status: ImportStatus::Rejected(err.into()),
                });
                continue;
            }
        };

        let (expected, existed) = match manifest.files.get(path) {
            Some(entry) if entry.content == content => continue,
            // Exported but never written: there is no version to create over.
            Some(entry) if entry.version == 0 => (Expected::Existing(0), true),
            Some(entry) => (Expected::Version(entry.version), true),
            None => (Expected::Version(0), false),
        };
        let status = match vfs.write_file_expecting(ctx, path, content, expected).await {
            Ok(outcome) if existed => ImportStatus::Updated {
                version: outcome.version,
            },
            Ok(outcome) => ImportStatus::Created {
                version: outcome.version,
            },
            Err(err) => ImportStatus::Rejected(err),
        };
        outcomes.push(ImportOutcome {
            path: path.clone(),
            status,
        });
    }

    for (path, entry) in &manifest.files {
        if seen.contains(path) {
            continue;
        }
        let status = match vfs.remove_file_if_version(ctx, path, entry.version) {
            Ok(()) => ImportStatus::Removed,
            Err(err) => ImportStatus::Rejected(err),
        };
        outcomes.push(ImportOutcome {
            path: path.clone(),
            status,
        });
    }

    outcomes
}
