//! Application context for unified dependency injection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::config::{ConfigStore, ShipyardConfig};
use crate::git::GitFetcher;
use crate::health::HttpProbe;
use crate::orchestration::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::provision::PythonVenvInstaller;
use crate::reconcile::{NginxProxy, RetryPolicy, SupervisorCtl};
use crate::render::FileSecretStore;

const DEFAULT_SUPERVISOR_CONF_DIR: &str = "/etc/supervisor/conf.d";
const DEFAULT_PROXY_CONF_DIR: &str = "/etc/nginx/sites-enabled";

/// Resolved configuration plus the paths derived from it.
///
/// Frontends create this once and build the [`Orchestrator`] from it.
#[derive(Debug, Clone)]
pub struct AppContext {
    config_path: PathBuf,
    config: ShipyardConfig,
    state_dir: PathBuf,
    apps_dir: PathBuf,
    supervisor_conf_dir: PathBuf,
    proxy_conf_dir: PathBuf,
}

impl AppContext {
    /// Load `config_path`, or the user default when `None`.
    pub fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let store = match config_path {
            Some(path) => ConfigStore::from_path(path),
            None => ConfigStore::user_default()?,
        };
        let config = store.load()?;
        config.validate().with_context(|| {
            format!("Invalid configuration: {}", store.config_path().display())
        })?;
        Self::from_config(store.config_path().to_path_buf(), config)
    }

    pub fn from_config(config_path: PathBuf, config: ShipyardConfig) -> anyhow::Result<Self> {
        let state_dir = match &config.paths.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
                .join("shipyard"),
        };
        let apps_dir = config
            .paths
            .apps_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("apps"));
        let supervisor_conf_dir = config
            .paths
            .supervisor_conf_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SUPERVISOR_CONF_DIR));
        let proxy_conf_dir = config
            .paths
            .proxy_conf_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROXY_CONF_DIR));

        Ok(Self {
            config_path,
            config,
            state_dir,
            apps_dir,
            supervisor_conf_dir,
            proxy_conf_dir,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> &ShipyardConfig {
        &self.config
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn apps_dir(&self) -> &Path {
        &self.apps_dir
    }

    pub fn supervisor_conf_dir(&self) -> &Path {
        &self.supervisor_conf_dir
    }

    pub fn proxy_conf_dir(&self) -> &Path {
        &self.proxy_conf_dir
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings::from_config(&self.config, self.state_dir.clone(), self.apps_dir.clone())
    }

    /// Host collaborators: git, venv/pip, supervisorctl, nginx and HTTP probes.
    pub fn collaborators(&self) -> anyhow::Result<Collaborators> {
        let reconcile = &self.config.reconcile;
        let retry = RetryPolicy::from_settings(reconcile);
        let probe = HttpProbe::new(std::time::Duration::from_secs(
            self.config.health.probe_timeout_secs,
        ))
        .context("Failed to build HTTP client for health probes")?;

        Ok(Collaborators {
            vcs: Arc::new(GitFetcher::new(self.state_dir.clone())),
            installer: Arc::new(PythonVenvInstaller::new(
                self.config.runtime.python.clone(),
                reconcile.hook_timeout(),
            )),
            secrets: Arc::new(FileSecretStore::new(&self.state_dir)),
            supervisor: Arc::new(SupervisorCtl::new(
                self.supervisor_conf_dir.clone(),
                reconcile.supervisor_command.clone(),
                retry.clone(),
                reconcile.command_timeout(),
            )),
            proxy: Arc::new(NginxProxy::new(
                self.proxy_conf_dir.clone(),
                reconcile.proxy_test_command.clone(),
                reconcile.proxy_reload_command.clone(),
                retry,
                reconcile.command_timeout(),
            )),
            probe: Arc::new(probe),
        })
    }

    pub fn orchestrator(&self) -> anyhow::Result<Orchestrator> {
        Ok(Orchestrator::new(self.settings(), self.collaborators()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_paths_resolve_under_state_dir() {
        let mut config = ShipyardConfig::new();
        config.paths.state_dir = Some(PathBuf::from("/srv/shipyard"));
        let ctx = AppContext::from_config(PathBuf::from("shipyard.toml"), config).unwrap();

        assert_eq!(ctx.apps_dir(), Path::new("/srv/shipyard/apps"));
        assert_eq!(ctx.supervisor_conf_dir(), Path::new("/etc/supervisor/conf.d"));
        assert_eq!(ctx.settings().state_dir, PathBuf::from("/srv/shipyard"));
    }

    #[test]
    fn loads_paths_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("shipyard.toml");
        let state = tmp.path().join("state");
        std::fs::write(
            &path,
            format!("[paths]\nstate_dir = {:?}\n", state.display().to_string()),
        )
        .unwrap();

        let ctx = AppContext::load(Some(path)).unwrap();
        assert_eq!(ctx.state_dir(), state.as_path());
        assert_eq!(ctx.config().retention.keep_releases, 5);
    }
}
