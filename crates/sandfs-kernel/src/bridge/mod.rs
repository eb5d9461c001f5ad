//! Host bridge: run a host program against a sandbox subtree.
//!
//! A run goes through fixed phases:
//!
//! ```text
//! Idle → Materializing → Executing → Importing | Skipped → CleanedUp
//! ```
//!
//! The subtree is copied into a fresh scratch directory, the program runs
//! with that directory as its working directory, and (if requested) changed
//! files are written back through the normal versioned write path. The
//! scratch directory is removed on every exit path, including failures.

mod exec;
mod import;
mod materialize;

use std::fmt;
use std::time::Duration;

use sandfs_types::{HostBridgeError, VfsError, VfsPath, VfsResult};

use crate::vfs::{AccessContext, VirtualFileSystem};

/// A host program invocation.
#[derive(Debug, Clone, Default)]
pub struct HostCommand {
    pub program: String,
    /// Arguments naming a sandbox path under the bridged subtree are rewritten
    /// to the materialized host path.
    pub args: Vec<String>,
    /// Falls back to the sandbox's configured host timeout.
    pub timeout: Option<Duration>,
    /// Write host-side changes back into the sandbox after the run.
    pub import_back: bool,
    pub env: Vec<(String, String)>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn import_back(mut self, import: bool) -> Self {
        self.import_back = import;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What happened to one file during import.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportStatus {
    Created { version: u64 },
    Updated { version: u64 },
    Removed,
    /// The sandbox refused the change (version conflict, policy, ...).
    Rejected(VfsError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub path: VfsPath,
    pub status: ImportStatus,
}

/// Result of a host bridge run.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Per-file import results; empty when import was not requested.
    pub imports: Vec<ImportOutcome>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Imports the sandbox refused.
    pub fn rejected(&self) -> impl Iterator<Item = &ImportOutcome> {
        self.imports
            .iter()
            .filter(|o| matches!(o.status, ImportStatus::Rejected(_)))
    }
}

/// Phase of a host bridge run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Idle,
    Materializing,
    Executing,
    Importing,
    Skipped,
    CleanedUp,
}

impl BridgePhase {
    /// Whether `next` may follow this phase. Any phase may go to cleanup.
    pub fn can_advance_to(self, next: BridgePhase) -> bool {
        use BridgePhase::*;
        matches!(
            (self, next),
            (Idle, Materializing)
                | (Materializing, Executing)
                | (Executing, Importing)
                | (Executing, Skipped)
                | (Idle | Materializing | Executing | Importing | Skipped, CleanedUp)
        )
    }
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgePhase::Idle => "idle",
            BridgePhase::Materializing => "materializing",
            BridgePhase::Executing => "executing",
            BridgePhase::Importing => "importing",
            BridgePhase::Skipped => "skipped",
            BridgePhase::CleanedUp => "cleaned-up",
        })
    }
}

struct PhaseTracker {
    phase: BridgePhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: BridgePhase::Idle,
        }
    }

    fn advance(&mut self, next: BridgePhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "bridge phase {} cannot go to {}",
            self.phase,
            next
        );
        tracing::debug!(from = %self.phase, to = %next, "bridge phase");
        self.phase = next;
    }
}

impl VirtualFileSystem {
    /// Materialize `path`, run `command` in it on the host, and optionally
    /// import the changes.
    ///
    /// A non-zero exit still imports; a timeout or a failure to start the
    /// program does not. The scratch directory is always removed.
    #[tracing::instrument(
        level = "info",
        skip(self, ctx, command),
        fields(path = %path, program = %command.program)
    )]
    pub async fn host_bridge_run(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        command: &HostCommand,
    ) -> VfsResult<CommandResult> {
        let mut phase = PhaseTracker::new();
        phase.advance(BridgePhase::Materializing);

        let base = self.config.temp_base();
        let scratch = tempfile::Builder::new()
            .prefix("sandfs-")
            .tempdir_in(&base)
            .map_err(|e| {
                HostBridgeError::MaterializeFailed(format!(
                    "cannot create scratch directory in {}: {}",
                    base.display(),
                    e
                ))
            })?;

        let result = self.run_in(ctx, path, command, scratch.path(), &mut phase).await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            tracing::warn!(dir = %scratch_path.display(), "failed to remove scratch directory: {}", e);
        }
        phase.advance(BridgePhase::CleanedUp);
        result
    }

    async fn run_in(
        &self,
        ctx: &AccessContext,
        path: &VfsPath,
        command: &HostCommand,
        host_root: &std::path::Path,
        phase: &mut PhaseTracker,
    ) -> VfsResult<CommandResult> {
        let manifest = materialize::export_subtree(self, ctx, path, host_root)
            .await
            .map_err(|e| HostBridgeError::MaterializeFailed(e.to_string()))?;
        tracing::debug!(files = manifest.files.len(), "materialized");

        phase.advance(BridgePhase::Executing);
        let args = exec::translate_args(&command.args, path, host_root);
        let timeout = command.timeout.unwrap_or_else(|| self.config.host_timeout());
        let output = exec::run_host(&command.program, &args, host_root, &command.env, timeout)
            .await
            .inspect_err(|e| tracing::warn!("host command failed: {}", e))?;
        tracing::info!(exit_code = ?output.exit_code, "host command finished");

        let imports = if command.import_back {
            phase.advance(BridgePhase::Importing);
            import::import_changes(self, ctx, path, host_root, &manifest).await
        } else {
            phase.advance(BridgePhase::Skipped);
            Vec::new()
        };

        Ok(CommandResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            imports,
        })
    }

    /// Convenience form of [`host_bridge_run`](Self::host_bridge_run) with an
    /// unrestricted context.
    pub async fn host_bridge_run_simple(
        &self,
        path: &VfsPath,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
        import_back: bool,
    ) -> VfsResult<CommandResult> {
        let mut command = HostCommand::new(program)
            .args(args.iter().copied())
            .import_back(import_back);
        command.timeout = timeout;
        self.host_bridge_run(&self.context(), path, &command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_follow_the_lifecycle() {
        use BridgePhase::*;
        assert!(Idle.can_advance_to(Materializing));
        assert!(Executing.can_advance_to(Importing));
        assert!(Executing.can_advance_to(Skipped));
        assert!(Materializing.can_advance_to(CleanedUp));
        assert!(!Idle.can_advance_to(Executing));
        assert!(!Skipped.can_advance_to(Importing));
        assert!(!CleanedUp.can_advance_to(Idle));
    }

    #[test]
    fn command_builder() {
        let cmd = HostCommand::new("grep")
            .args(["-r", "TODO"])
            .arg("/work")
            .timeout(Duration::from_secs(2))
            .import_back(true)
            .env("LC_ALL", "C");
        assert_eq!(cmd.args, vec!["-r", "TODO", "/work"]);
        assert_eq!(cmd.timeout, Some(Duration::from_secs(2)));
        assert!(cmd.import_back);
        assert_eq!(cmd.env, vec![("LC_ALL".to_string(), "C".to_string())]);
    }
}
