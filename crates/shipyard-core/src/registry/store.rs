//! Persistent project registry (`projects.toml`).

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ports::{self, check_port_start, project_range, ranges_overlap};
use super::types::{DEFAULT_ENVIRONMENTS, EnvironmentEntry, Project, ProjectRequest, validate_name};
use crate::config::parser::enhance_toml_error;
use crate::fs::{PathLock, PathLockGuard, write_atomic};

const REGISTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    projects: BTreeMap<String, Project>,
}

/// Registry of projects and their environments.
///
/// Mutations are serialized by a registry-wide lock file and persisted with
/// an atomic replace; reads never take the lock.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    path: PathBuf,
    lock: PathLock,
}

impl ProjectRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("projects.toml"),
            lock: PathLock::new(state_dir.join("locks").join("registry.lock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Option<Project>> {
        Ok(self.load()?.projects.remove(name))
    }

    pub fn list(&self) -> anyhow::Result<Vec<Project>> {
        Ok(self.load()?.projects.into_values().collect())
    }

    pub fn register_project(&self, request: ProjectRequest) -> anyhow::Result<Project> {
        validate_name("project", &request.name)?;
        check_port_start(request.port_start)?;
        if request.repository.trim().is_empty() {
            anyhow::bail!("project repository must not be empty");
        }

        let envs: Vec<String> = if request.environments.is_empty() {
            DEFAULT_ENVIRONMENTS.iter().map(|s| s.to_string()).collect()
        } else {
            request.environments.clone()
        };
        if envs.len() > ports::MAX_ENVIRONMENTS as usize {
            anyhow::bail!(
                "a project may have at most {} environments",
                ports::MAX_ENVIRONMENTS
            );
        }
        for env in &envs {
            validate_name("environment", env)?;
        }

        let _guard = self.lock()?;
        let mut file = self.load()?;

        if file.projects.contains_key(&request.name) {
            anyhow::bail!("project '{}' is already registered", request.name);
        }
        let wanted = project_range(request.port_start);
        if let Some(other) = file
            .projects
            .values()
            .find(|p| ranges_overlap(&wanted, &project_range(p.port_start)))
        {
            anyhow::bail!(
                "ports {}..{} overlap project '{}' ({}..{})",
                wanted.start,
                wanted.end,
                other.name,
                other.port_start,
                project_range(other.port_start).end
            );
        }

        let now = Utc::now();
        let mut project = Project {
            name: request.name.clone(),
            repository: request.repository.trim().to_string(),
            default_branch: request.default_branch.unwrap_or_else(|| "main".to_string()),
            port_start: request.port_start,
            description: request.description.unwrap_or_default(),
            created_at: now,
            environments: BTreeMap::new(),
        };
        for (slot, env) in envs.into_iter().enumerate() {
            project.environments.entry(env).or_insert(EnvironmentEntry {
                slot: slot as u8,
                domain: None,
                ssl: false,
                created_at: now,
            });
        }

        file.projects.insert(project.name.clone(), project.clone());
        self.save(&file)?;
        tracing::info!(project = %project.name, port_start = project.port_start, "registered project");
        Ok(project)
    }

    /// Add an environment, or update the domain/ssl settings of an existing one.
    pub fn register_environment(
        &self,
        project: &str,
        environment: &str,
        domain: Option<String>,
        ssl: bool,
    ) -> anyhow::Result<EnvironmentEntry> {
        validate_name("environment", environment)?;
        let _guard = self.lock()?;
        let mut file = self.load()?;
        let entry = file
            .projects
            .get_mut(project)
            .ok_or_else(|| anyhow::anyhow!("project '{}' is not registered", project))?;

        let env = match entry.environments.get_mut(environment) {
            Some(existing) => {
                existing.domain = domain;
                existing.ssl = ssl;
                existing.clone()
            }
            None => {
                let slot = entry.next_free_slot().ok_or_else(|| {
                    anyhow::anyhow!(
                        "project '{}' already has {} environments",
                        project,
                        ports::MAX_ENVIRONMENTS
                    )
                })?;
                let created = EnvironmentEntry {
                    slot,
                    domain,
                    ssl,
                    created_at: Utc::now(),
                };
                entry
                    .environments
                    .insert(environment.to_string(), created.clone());
                created
            }
        };

        self.save(&file)?;
        tracing::info!(project, environment, slot = env.slot, "registered environment");
        Ok(env)
    }

    /// Remove a project entry. Returns the removed project, if any.
    pub fn remove_project(&self, name: &str) -> anyhow::Result<Option<Project>> {
        let _guard = self.lock()?;
        let mut file = self.load()?;
        let removed = file.projects.remove(name);
        if removed.is_some() {
            self.save(&file)?;
        }
        Ok(removed)
    }

    fn lock(&self) -> anyhow::Result<PathLockGuard> {
        self.lock
            .acquire_within("registry", REGISTRY_LOCK_TIMEOUT)
            .context("Failed to lock project registry")
    }

    fn load(&self) -> anyhow::Result<RegistryFile> {
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read registry: {}", self.path.display()))?;
        toml::from_str(&content)
            .map_err(|e| enhance_toml_error(e, &content))
            .with_context(|| format!("Failed to parse registry: {}", self.path.display()))
    }

    fn save(&self, file: &RegistryFile) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(file).context("Failed to serialize registry")?;
        write_atomic(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write registry: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn register_creates_default_environments() {
        let tmp = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(tmp.path());

        let project = registry
            .register_project(ProjectRequest::new("checkout", "https://example.com/x.git", 8100))
            .unwrap();

        let slots: Vec<(String, u8)> = project
            .environments
            .iter()
            .map(|(name, env)| (name.clone(), env.slot))
            .collect();
        assert_eq!(
            slots,
            vec![
                ("prod".to_string(), 2),
                ("qa".to_string(), 0),
                ("stage".to_string(), 1)
            ]
        );
        assert_eq!(registry.get("checkout").unwrap(), Some(project));
    }

    #[test]
    fn rejects_duplicate_and_overlapping_projects() {
        let tmp = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(tmp.path());
        registry
            .register_project(ProjectRequest::new("checkout", "repo-a", 8100))
            .unwrap();

        let dup = registry.register_project(ProjectRequest::new("checkout", "repo-b", 9000));
        assert!(dup.unwrap_err().to_string().contains("already registered"));

        let overlap = registry.register_project(ProjectRequest::new("billing", "repo-b", 8200));
        assert!(overlap.unwrap_err().to_string().contains("overlap"));

        registry
            .register_project(ProjectRequest::new("billing", "repo-b", 8260))
            .unwrap();
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn register_environment_takes_next_slot_and_updates_existing() {
        let tmp = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(tmp.path());
        registry
            .register_project(
                ProjectRequest::new("checkout", "repo", 8100).with_environments(["qa", "prod"]),
            )
            .unwrap();

        let preview = registry
            .register_environment("checkout", "preview", None, false)
            .unwrap();
        assert_eq!(preview.slot, 2);

        let prod = registry
            .register_environment("checkout", "prod", Some("shop.example.com".into()), true)
            .unwrap();
        assert_eq!(prod.slot, 1);
        assert!(prod.ssl);

        let missing = registry.register_environment("nope", "qa", None, false);
        assert!(missing.is_err());
    }

    #[test]
    fn remove_project_persists() {
        let tmp = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(tmp.path());
        registry
            .register_project(ProjectRequest::new("checkout", "repo", 8100))
            .unwrap();

        assert!(registry.remove_project("checkout").unwrap().is_some());
        assert!(registry.remove_project("checkout").unwrap().is_none());
        assert!(registry.get("checkout").unwrap().is_none());
    }
}
