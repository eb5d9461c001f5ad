//! Host process execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sandfs_types::{HostBridgeError, VfsPath};
use tokio::process::Command;

/// Captured output of a finished host process.
#[derive(Debug)]
pub(crate) struct HostOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// Run `program` in `cwd` and wait for it, killing it if `timeout` elapses.
pub(crate) async fn run_host(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<HostOutput, HostBridgeError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Dropping the wait future on timeout kills the child.
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .map_err(|e| HostBridgeError::ExecutionFailed(format!("{}: {}", program, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(HostBridgeError::ExecutionFailed(format!(
                "{}: failed to wait: {}",
                program, e
            )));
        }
        Err(_) => {
            return Err(HostBridgeError::Timeout {
                program: program.to_string(),
                after_ms: timeout.as_millis() as u64,
            });
        }
    };

    Ok(HostOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

/// Rewrite arguments that name a sandbox path under `root` to the
/// corresponding host path under `host_root`. Other arguments pass through.
pub(crate) fn translate_args(args: &[String], root: &VfsPath, host_root: &Path) -> Vec<String> {
    args.iter()
        .map(|arg| match host_path_for(arg, root, host_root) {
            Some(host) => host.to_string_lossy().into_owned(),
            None => arg.clone(),
        })
        .collect()
}

fn host_path_for(arg: &str, root: &VfsPath, host_root: &Path) -> Option<PathBuf> {
    if !arg.starts_with('/') {
        return None;
    }
    let path = VfsPath::parse(arg).ok()?;
    let rel = path.strip_prefix(root)?;
    Some(super::materialize::join_host(host_root, rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_paths_are_translated() {
        let root = VfsPath::parse("/work").unwrap();
        let host = Path::new("/tmp/sandfs-x");
        let args = vec![
            "-n".to_string(),
            "/work/src/main.rs".to_string(),
            "/work".to_string(),
            "/etc/passwd".to_string(),
            "relative.txt".to_string(),
        ];

        let out = translate_args(&args, &root, host);

        assert_eq!(
            out,
            vec![
                "-n",
                "/tmp/sandfs-x/src/main.rs",
                "/tmp/sandfs-x",
                "/etc/passwd",
                "relative.txt",
            ]
        );
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_host(
            "sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            dir.path(),
            &[],
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_program_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_host(
            "sandfs-no-such-program",
            &[],
            dir.path(),
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HostBridgeError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_host(
            "sleep",
            &["10".to_string()],
            dir.path(),
            &[],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HostBridgeError::Timeout { after_ms: 100, .. }));
    }
}
