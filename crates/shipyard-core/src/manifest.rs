//! Deploy manifest shipped inside each project's repository.
//!
//! Looked up in the release root as `deploy-<env>.toml`, `deploy.toml`,
//! `deploy-<env>.yaml`, `deploy-<env>.yml`, `deploy.yaml` or `deploy.yml`;
//! the first match wins.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::parser::enhance_toml_error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    /// Environment the manifest is written for; unset means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(default = "default_requirements")]
    pub requirements: String,
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub hooks: Hooks,
    #[serde(rename = "static", default = "default_static")]
    pub static_aliases: Vec<StaticAlias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_dir: Option<String>,
}

fn default_requirements() -> String {
    "requirements.txt".to_string()
}

fn default_static() -> Vec<StaticAlias> {
    vec![StaticAlias {
        url: "/static/".to_string(),
        dir: "staticfiles".to_string(),
    }]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Serves HTTP behind the proxy.
    #[default]
    #[serde(alias = "django")]
    Web,
    Worker,
    Scheduler,
    Custom,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Web => "web",
            ServiceKind::Worker => "worker",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ServiceKind,
    /// Command template, e.g. `gunicorn app.wsgi --bind 127.0.0.1:${PORT}`.
    pub command: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    /// Whether the service is assigned a port.
    pub fn needs_port(&self) -> bool {
        self.kind == ServiceKind::Web || self.health_check.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Path probed on the service's port, e.g. `/health/`.
    pub endpoint: String,
    /// Seconds between probes.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Seconds before the service is declared unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_health_interval() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Memory ceiling in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    /// CPU share, 1.0 = one core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,
}

/// Value of an `env_vars` entry: a literal or a reference into the secret store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Secret { secret: String },
    Text(String),
    Boolean(bool),
    Integer(i64),
    Float(f64),
}

impl EnvValue {
    /// Literal value as text; `None` for secret references.
    pub fn literal(&self) -> Option<String> {
        match self {
            EnvValue::Secret { .. } => None,
            EnvValue::Text(s) => Some(s.clone()),
            EnvValue::Boolean(b) => Some(b.to_string()),
            EnvValue::Integer(i) => Some(i.to_string()),
            EnvValue::Float(f) => Some(f.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_deploy: Vec<String>,
    #[serde(default)]
    pub post_deploy: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAlias {
    /// URL prefix, e.g. `/static/`.
    pub url: String,
    /// Directory relative to the working directory.
    pub dir: String,
}

impl Manifest {
    /// Candidate manifest file names for `environment`, in lookup order.
    pub fn candidates(environment: &str) -> Vec<String> {
        vec![
            format!("deploy-{}.toml", environment),
            "deploy.toml".to_string(),
            format!("deploy-{}.yaml", environment),
            format!("deploy-{}.yml", environment),
            "deploy.yaml".to_string(),
            "deploy.yml".to_string(),
        ]
    }

    /// Locate, parse and validate the manifest in `release_dir`.
    pub fn discover(release_dir: &Path, environment: &str) -> anyhow::Result<(PathBuf, Self)> {
        let path = Self::candidates(environment)
            .into_iter()
            .map(|name| release_dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No deploy manifest found in {} (looked for deploy-{}.toml, deploy.toml and YAML variants)",
                    release_dir.display(),
                    environment
                )
            })?;
        let manifest = Self::load(&path)?;
        if let Some(declared) = &manifest.environment
            && declared != environment
        {
            anyhow::bail!(
                "Manifest {} is written for environment '{}', not '{}'",
                path.display(),
                declared,
                environment
            );
        }
        Ok((path, manifest))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
        let manifest = if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_yaml_str(&content)
        };
        manifest.with_context(|| format!("Invalid manifest: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| enhance_toml_error(e, content))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let manifest: Manifest =
            serde_yaml::from_str(content).context("YAML parsing error")?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("manifest 'name' must not be empty");
        }
        if self.services.is_empty() {
            anyhow::bail!("manifest must declare at least one service");
        }
        let mut seen = HashSet::new();
        for service in &self.services {
            let valid_name = !service.name.is_empty()
                && service
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid_name {
                anyhow::bail!(
                    "service name '{}' may only contain letters, digits, '-' and '_'",
                    service.name
                );
            }
            if !seen.insert(service.name.as_str()) {
                anyhow::bail!("service '{}' is declared twice", service.name);
            }
            if service.command.trim().is_empty() {
                anyhow::bail!("service '{}' has an empty command", service.name);
            }
            if let Some(check) = &service.health_check {
                if !check.endpoint.starts_with('/') {
                    anyhow::bail!(
                        "service '{}': health_check.endpoint must start with '/'",
                        service.name
                    );
                }
                if check.interval == 0 {
                    anyhow::bail!(
                        "service '{}': health_check.interval must be greater than zero",
                        service.name
                    );
                }
            }
        }
        for alias in &self.static_aliases {
            if !alias.url.starts_with('/') {
                anyhow::bail!("static url '{}' must start with '/'", alias.url);
            }
        }
        Ok(())
    }

    /// Services that will be started, in declaration order.
    pub fn enabled_services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOML: &str = r#"
name = "checkout"
python_version = "3.12"

[[services]]
name = "web"
type = "web"
command = "gunicorn app.wsgi --bind 127.0.0.1:${PORT}"
health_check = { endpoint = "/health/", interval = 2 }
resources = { max_memory = 512, max_cpu = 0.5 }

[[services]]
name = "celery_worker"
type = "worker"
command = "celery -A app worker -Q ${QUEUE_NAME}"

[env_vars]
DEBUG = false
WORKERS = 3
DATABASE_URL = { secret = "DATABASE_URL" }

[hooks]
pre_deploy = ["python manage.py migrate"]
"#;

    #[test]
    fn parses_toml_manifest() {
        let manifest = Manifest::from_toml_str(TOML).unwrap();
        assert_eq!(manifest.name, "checkout");
        assert_eq!(manifest.requirements, "requirements.txt");
        assert_eq!(manifest.services.len(), 2);
        assert!(manifest.services[0].needs_port());
        assert!(!manifest.services[1].needs_port());
        assert_eq!(manifest.env_vars["DEBUG"].literal().as_deref(), Some("false"));
        assert_eq!(manifest.env_vars["WORKERS"].literal().as_deref(), Some("3"));
        assert_eq!(
            manifest.env_vars["DATABASE_URL"],
            EnvValue::Secret {
                secret: "DATABASE_URL".into()
            }
        );
        assert_eq!(manifest.static_aliases[0].url, "/static/");
        assert_eq!(manifest.hooks.pre_deploy.len(), 1);
    }

    #[test]
    fn parses_yaml_with_legacy_service_type() {
        let yaml = r#"
name: checkout
services:
  - name: web
    type: django
    command: gunicorn app.wsgi --bind 127.0.0.1:${PORT}
    health_check:
      endpoint: /health/
      interval: 10
  - name: beat
    type: scheduler
    command: celery -A app beat
    enabled: false
static:
  - url: /assets/
    dir: public
"#;
        let manifest = Manifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.services[0].kind, ServiceKind::Web);
        assert_eq!(manifest.enabled_services().count(), 1);
        assert_eq!(manifest.static_aliases[0].dir, "public");
    }

    #[test]
    fn requires_name_and_services() {
        assert!(Manifest::from_yaml_str("name: x\n").is_err());
        assert!(Manifest::from_yaml_str("services: []\nname: ''\n").is_err());
        let dup = "name: x\nservices:\n  - {name: a, command: run}\n  - {name: a, command: run}\n";
        assert!(
            Manifest::from_yaml_str(dup)
                .unwrap_err()
                .to_string()
                .contains("twice")
        );
    }

    #[test]
    fn discovery_prefers_environment_specific_toml() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("deploy.yaml"),
            "name: generic\nservices:\n  - {name: web, command: run}\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("deploy-qa.toml"),
            "name = \"qa-only\"\n[[services]]\nname = \"web\"\ncommand = \"run\"\n",
        )
        .unwrap();

        let (path, manifest) = Manifest::discover(tmp.path(), "qa").unwrap();
        assert!(path.ends_with("deploy-qa.toml"));
        assert_eq!(manifest.name, "qa-only");

        let (_, prod) = Manifest::discover(tmp.path(), "prod").unwrap();
        assert_eq!(prod.name, "generic");
    }

    #[test]
    fn discovery_rejects_foreign_environment() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("deploy.yml"),
            "name: x\nenvironment: prod\nservices:\n  - {name: web, command: run}\n",
        )
        .unwrap();
        assert!(Manifest::discover(tmp.path(), "qa").is_err());
        assert!(Manifest::discover(TempDir::new().unwrap().path(), "qa").is_err());
    }
}
