//! Sandbox configuration.
//!
//! A sandbox is usually built with [`SandboxConfig::default`]; embedders that
//! keep settings on disk can load them from TOML with
//! [`SandboxConfig::load_from`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sandfs_types::NodePolicy;
use serde::{Deserialize, Serialize};

/// Configuration for a [`VirtualFileSystem`](crate::VirtualFileSystem).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Label recorded in snapshots and log spans.
    #[serde(default = "default_root_label")]
    pub root_label: String,

    /// Policy applied to paths with no explicit policy.
    #[serde(default)]
    pub default_policy: NodePolicy,

    /// Visibility label for paths with no explicit policy.
    #[serde(default = "default_visibility")]
    pub default_visibility: String,

    /// Directory under which host bridge scratch directories are created.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub temp_base: Option<PathBuf>,

    /// Host command timeout in milliseconds when the command sets none.
    #[serde(default = "default_host_timeout")]
    pub host_timeout_ms: u64,
}

fn default_root_label() -> String {
    "sandbox".to_string()
}

fn default_visibility() -> String {
    sandfs_types::DEFAULT_VISIBILITY.to_string()
}

fn default_host_timeout() -> u64 {
    30_000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root_label: default_root_label(),
            default_policy: NodePolicy::default(),
            default_visibility: default_visibility(),
            temp_base: None,
            host_timeout_ms: default_host_timeout(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid sandbox config")
    }

    pub fn with_root_label(mut self, label: impl Into<String>) -> Self {
        self.root_label = label.into();
        self
    }

    pub fn with_temp_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.temp_base = Some(base.into());
        self
    }

    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_default_policy(mut self, policy: NodePolicy) -> Self {
        self.default_visibility = policy.visibility.clone();
        self.default_policy = policy;
        self
    }

    /// The policy for paths with no explicit entry.
    ///
    /// `default_visibility` overrides the label in `default_policy`.
    pub fn effective_default_policy(&self) -> NodePolicy {
        let mut policy = self.default_policy.clone();
        policy.visibility = self.default_visibility.clone();
        policy
    }

    /// Base directory for host bridge scratch space.
    pub fn temp_base(&self) -> PathBuf {
        self.temp_base.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = SandboxConfig::from_toml_str("").unwrap();
        assert_eq!(config, SandboxConfig::default());
        assert_eq!(config.root_label, "sandbox");
        assert_eq!(config.host_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = SandboxConfig::from_toml_str(
            r#"
            root_label = "agent-7"
            default_visibility = "internal"
            host_timeout_ms = 500

            [default_policy]
            writable = false
            "#,
        )
        .unwrap();

        assert_eq!(config.root_label, "agent-7");
        assert_eq!(config.host_timeout_ms, 500);
        let policy = config.effective_default_policy();
        assert!(!policy.writable);
        assert!(policy.readable);
        assert_eq!(policy.visibility, "internal");
    }

    #[test]
    fn load_from_reports_missing_file() {
        let err = SandboxConfig::load_from(Path::new("/nonexistent/sandfs.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config"));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandfs.toml");
        std::fs::write(&path, "temp_base = \"/var/tmp/sandfs\"\n").unwrap();

        let config = SandboxConfig::load_from(&path).unwrap();
        assert_eq!(config.temp_base(), PathBuf::from("/var/tmp/sandfs"));
    }
}
