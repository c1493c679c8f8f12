//! Secret store collaborator.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resolves secret values for an environment.
pub trait SecretStore: Send + Sync {
    fn resolve(&self, project: &str, environment: &str, key: &str)
    -> anyhow::Result<Option<String>>;
}

/// Secrets kept as flat TOML tables at `<state>/secrets/<project>/<environment>.toml`.
///
/// ```toml
/// DATABASE_URL = "postgres://..."
/// SECRET_KEY = "..."
/// ```
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("secrets"),
        }
    }

    pub fn path(&self, project: &str, environment: &str) -> PathBuf {
        self.root
            .join(project)
            .join(format!("{}.toml", environment))
    }

    fn load(&self, project: &str, environment: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let path = self.path(project, environment);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read secrets: {}", path.display()))?;
        let table: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse secrets: {}", path.display()))?;
        let mut out = BTreeMap::new();
        for (key, value) in table {
            let text = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => anyhow::bail!(
                    "Secret '{}' in {} must be a scalar, found {}",
                    key,
                    path.display(),
                    other.type_str()
                ),
            };
            out.insert(key, text);
        }
        Ok(out)
    }
}

impl SecretStore for FileSecretStore {
    fn resolve(
        &self,
        project: &str,
        environment: &str,
        key: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.load(project, environment)?.remove(key))
    }
}
