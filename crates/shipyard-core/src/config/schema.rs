//! `shipyard.toml` schema.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::fs::LinkMode;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipyardConfig {
    pub paths: PathSettings,

    /// System user that supervised processes run as.
    pub deploy_user: Option<String>,

    /// How release directories are materialized from the snapshot cache.
    pub link_mode: LinkMode,

    pub health: HealthSettings,
    pub reconcile: ReconcileSettings,
    pub locks: LockSettings,
    pub retention: RetentionSettings,
    pub runtime: RuntimeSettings,
}

impl ShipyardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate cross-field constraints after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be greater than zero");
        }
        if self.health.timeout_secs < self.health.interval_secs {
            anyhow::bail!(
                "health.timeout_secs ({}) must be at least health.interval_secs ({})",
                self.health.timeout_secs,
                self.health.interval_secs
            );
        }
        if self.health.failure_threshold == Some(0) {
            anyhow::bail!("health.failure_threshold must be at least 1");
        }
        if self.reconcile.retry_attempts == 0 {
            anyhow::bail!("reconcile.retry_attempts must be at least 1");
        }
        if self.retention.keep_releases < 2 {
            anyhow::bail!("retention.keep_releases must be at least 2 to keep a rollback target");
        }
        for (name, cmd) in [
            ("reconcile.supervisor_command", &self.reconcile.supervisor_command),
            ("reconcile.proxy_test_command", &self.reconcile.proxy_test_command),
            ("reconcile.proxy_reload_command", &self.reconcile.proxy_reload_command),
        ] {
            if cmd.is_empty() {
                anyhow::bail!("{} must not be empty", name);
            }
        }
        Ok(())
    }

    pub fn deploy_user(&self) -> String {
        self.deploy_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "deploy".to_string())
    }
}

/// Filesystem layout. Unset entries resolve relative to the state directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Registry, ledger, locks, git cache and secrets.
    pub state_dir: Option<PathBuf>,
    /// Per-project releases, runtimes and logs.
    pub apps_dir: Option<PathBuf>,
    /// Directory supervisord includes program files from.
    pub supervisor_conf_dir: Option<PathBuf>,
    /// Directory the reverse proxy includes site files from.
    pub proxy_conf_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive failed probes before a service is unhealthy.
    /// Defaults to enough probes to cover the timeout.
    pub failure_threshold: Option<u32>,
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 60,
            failure_threshold: None,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Time the previous release keeps running after promotion.
    pub grace_period_secs: u64,
    pub hook_timeout_secs: u64,
    /// Timeout for a single supervisor/proxy control command.
    pub command_timeout_secs: u64,
    pub supervisor_command: Vec<String>,
    pub proxy_test_command: Vec<String>,
    pub proxy_reload_command: Vec<String>,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_initial_ms: 500,
            retry_max_ms: 5_000,
            grace_period_secs: 10,
            hook_timeout_secs: 300,
            command_timeout_secs: 60,
            supervisor_command: vec!["supervisorctl".to_string()],
            proxy_test_command: vec!["sudo".to_string(), "nginx".to_string(), "-t".to_string()],
            proxy_reload_command: vec![
                "sudo".to_string(),
                "nginx".to_string(),
                "-s".to_string(),
                "reload".to_string(),
            ],
        }
    }
}

impl ReconcileSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Age after which `cleanup` may reclaim an environment lock.
    pub stale_after_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after_secs: 1800,
        }
    }
}

impl LockSettings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub keep_releases: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { keep_releases: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Interpreter used when the requested version is not installed.
    pub python: String,
    pub default_python_version: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            default_python_version: "3.11".to_string(),
        }
    }
}
