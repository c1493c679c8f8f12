//! Config store for loading and saving shipyard.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{ShipyardConfig, parser};
use crate::fs::write_atomic;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Store at `$XDG_CONFIG_HOME/shipyard/shipyard.toml`.
    pub fn user_default() -> anyhow::Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("shipyard");
        Ok(Self::from_path(dir.join("shipyard.toml")))
    }

    pub fn from_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn load(&self) -> anyhow::Result<ShipyardConfig> {
        if !self.config_path.exists() {
            return Ok(ShipyardConfig::new());
        }
        parser::parse_config(&self.config_path)
    }

    pub fn save(&self, config: &ShipyardConfig) -> anyhow::Result<()> {
        config.validate()?;
        let content = parser::to_toml(config).context("Failed to serialize config to TOML")?;
        write_atomic(&self.config_path, content.as_bytes()).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::from_path(temp.path().join("shipyard.toml"));

        assert_eq!(store.load().unwrap(), ShipyardConfig::new());
    }

    #[test]
    fn save_then_load() {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::from_path(temp.path().join("nested/shipyard.toml"));
        let mut config = ShipyardConfig::new();
        config.deploy_user = Some("deployer".to_string());
        config.locks.stale_after_secs = 60;

        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap(), config);
    }
}
