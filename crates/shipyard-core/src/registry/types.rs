use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environments created when a registration does not name any.
pub const DEFAULT_ENVIRONMENTS: [&str; 3] = ["qa", "stage", "prod"];

/// A registered application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Source repository locator (URL or local path).
    pub repository: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// First port of the project's range.
    pub port_start: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentEntry>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Project {
    pub fn environment(&self, name: &str) -> Option<&EnvironmentEntry> {
        self.environments.get(name)
    }

    /// Lowest environment slot not yet taken.
    pub(crate) fn next_free_slot(&self) -> Option<u8> {
        (0..super::ports::MAX_ENVIRONMENTS).find(|slot| {
            !self
                .environments
                .values()
                .any(|entry| entry.slot == *slot)
        })
    }
}

/// An environment of a project, e.g. `checkout/prod`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    /// Index into the project's port range.
    pub slot: u8,
    /// Proxy server name; `_` (any host) when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to `register_project`.
#[derive(Debug, Clone)]
pub struct ProjectRequest {
    pub name: String,
    pub repository: String,
    pub port_start: u16,
    pub default_branch: Option<String>,
    pub description: Option<String>,
    /// Environments to create; defaults to qa, stage and prod.
    pub environments: Vec<String>,
}

impl ProjectRequest {
    pub fn new(name: impl Into<String>, repository: impl Into<String>, port_start: u16) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            port_start,
            default_branch: None,
            description: None,
            environments: Vec::new(),
        }
    }

    pub fn with_environments<I, S>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = envs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Names end up in paths, supervisor program names and proxy upstreams.
pub fn validate_name(kind: &str, name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 48 {
        anyhow::bail!("{} name must be 1-48 characters: '{}'", kind, name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        anyhow::bail!(
            "{} name may only contain lowercase letters, digits and '-': '{}'",
            kind,
            name
        );
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("{} name must not start or end with '-': '{}'", kind, name);
    }
    Ok(())
}
