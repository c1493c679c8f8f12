//! Deploy/rollback/cleanup orchestration.
//!
//! The [`Orchestrator`] owns the per-environment lock and sequences the
//! fetcher, provisioner, renderer, reconciler and health gate. Everything that
//! changes what is live goes through one ledger transaction; the `current`
//! symlink is repointed after that transaction and repaired by cleanup.

mod attempt;
pub mod cleanup;
pub mod deploy;
pub mod query;
mod retention;
pub mod rollback;

pub use cleanup::CleanupReport;
pub use deploy::DeployRequest;
pub use query::EnvironmentStatus;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ShipyardConfig;
use crate::error::{DeployError, Step};
use crate::fetch::{RevisionFetcher, VersionControl};
use crate::fs::{LinkMode, PathLock, PathLockGuard};
use crate::health::{HealthGate, HealthPolicy, HealthProbe, HealthTarget};
use crate::ledger::{Release, ReleaseLedger};
use crate::provision::{RuntimeInstaller, RuntimeProvisioner};
use crate::reconcile::{HookRunner, ProcessSupervisor, Reconciler, ReverseProxy};
use crate::registry::{EnvironmentEntry, PortPlan, Project, ProjectRegistry, ProjectRequest};
use crate::render::{self, RenderContext, RenderedRelease, SecretStore};

/// Tunables the orchestrator needs from the host configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub state_dir: PathBuf,
    pub apps_dir: PathBuf,
    pub link_mode: LinkMode,
    pub deploy_user: String,
    pub default_python_version: String,
    pub grace_period: Duration,
    pub hook_timeout: Duration,
    pub stale_after: Duration,
    pub keep_releases: usize,
    pub health: HealthPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ShipyardConfig, state_dir: PathBuf, apps_dir: PathBuf) -> Self {
        Self {
            state_dir,
            apps_dir,
            link_mode: config.link_mode,
            deploy_user: config.deploy_user(),
            default_python_version: config.runtime.default_python_version.clone(),
            grace_period: config.reconcile.grace_period(),
            hook_timeout: config.reconcile.hook_timeout(),
            stale_after: config.locks.stale_after(),
            keep_releases: config.retention.keep_releases,
            health: HealthPolicy::from_settings(&config.health),
        }
    }
}

/// External systems the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub vcs: Arc<dyn VersionControl>,
    pub installer: Arc<dyn RuntimeInstaller>,
    pub secrets: Arc<dyn SecretStore>,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub proxy: Arc<dyn ReverseProxy>,
    pub probe: Arc<dyn HealthProbe>,
}

#[derive(Clone)]
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: ProjectRegistry,
    ledger: ReleaseLedger,
    fetcher: RevisionFetcher,
    provisioner: RuntimeProvisioner,
    secrets: Arc<dyn SecretStore>,
    reconciler: Reconciler,
    health: HealthGate,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            vcs,
            installer,
            secrets,
            supervisor,
            proxy,
            probe,
        } = collaborators;
        Self {
            registry: ProjectRegistry::new(&settings.state_dir),
            ledger: ReleaseLedger::new(&settings.state_dir),
            fetcher: RevisionFetcher::new(vcs, settings.apps_dir.clone(), settings.link_mode),
            provisioner: RuntimeProvisioner::new(
                installer,
                settings.apps_dir.clone(),
                settings.default_python_version.clone(),
            ),
            secrets,
            reconciler: Reconciler::new(
                supervisor.clone(),
                proxy,
                HookRunner::new(settings.hook_timeout),
            ),
            health: HealthGate::new(probe, supervisor),
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &ReleaseLedger {
        &self.ledger
    }

    pub async fn register_project(&self, request: ProjectRequest) -> Result<Project, DeployError> {
        self.mutate_registry(move |registry| registry.register_project(request))
            .await
    }

    pub async fn register_environment(
        &self,
        project: &str,
        environment: &str,
        domain: Option<String>,
        ssl: bool,
    ) -> Result<EnvironmentEntry, DeployError> {
        let (project, environment) = (project.to_string(), environment.to_string());
        self.mutate_registry(move |registry| {
            registry.register_environment(&project, &environment, domain, ssl)
        })
        .await
    }

    /// Registry writes wait on a file lock, so they run on the blocking pool.
    async fn mutate_registry<T, F>(&self, change: F) -> Result<T, DeployError>
    where
        T: Send + 'static,
        F: FnOnce(&ProjectRegistry) -> anyhow::Result<T> + Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || change(&registry))
            .await
            .map_err(|e| DeployError::Registry(format!("registry task failed: {}", e)))?
            .map_err(|e| DeployError::Registry(format!("{:#}", e)))
    }

    /// Remove a project. Refuses while any environment has a live release
    /// unless `force`, in which case live programs and proxy sites are removed.
    pub async fn deregister_project(&self, name: &str, force: bool) -> Result<Project, DeployError> {
        let project = self.project(name)?;
        let mut guards = Vec::new();
        for environment in project.environments.keys() {
            guards.push(self.lock_environment(name, environment, "deregister")?);
        }

        let mut live = Vec::new();
        for environment in self.ledger.environments(name).map_err(DeployError::ledger)? {
            if let Some(release) = self
                .ledger
                .current(name, &environment)
                .map_err(DeployError::ledger)?
            {
                live.push((environment, release));
            }
        }

        if !live.is_empty() && !force {
            let envs: Vec<&str> = live.iter().map(|(env, _)| env.as_str()).collect();
            return Err(DeployError::Registry(format!(
                "project '{}' has live releases in {}; pass --force to tear them down",
                name,
                envs.join(", ")
            )));
        }

        for (environment, release) in &live {
            self.reconciler
                .teardown(&release.programs)
                .await
                .map_err(|e| DeployError::reconcile(Step::Teardown, e))?;
            self.reconciler
                .proxy()
                .remove(&render::site_name(name, environment))
                .await
                .map_err(|e| DeployError::reconcile(Step::Teardown, e))?;
        }

        self.ledger.remove_project(name).map_err(DeployError::ledger)?;
        let owned = name.to_string();
        let removed = self
            .mutate_registry(move |registry| registry.remove_project(&owned))
            .await?
            .unwrap_or(project);
        drop(guards);
        tracing::info!(
            project = name,
            apps = %self.settings.apps_dir.join(name).display(),
            "project deregistered; release files left on disk"
        );
        Ok(removed)
    }

    /// Delete every deployment record of a project. Releases, and therefore
    /// what is live, are left alone. Refuses unless `force` when there is
    /// anything to delete.
    pub fn reset_deployments(&self, name: &str, force: bool) -> Result<usize, DeployError> {
        let project = self.project(name)?;
        let mut guards = Vec::new();
        for environment in project.environments.keys() {
            guards.push(self.lock_environment(name, environment, "reset")?);
        }

        let environments = self.ledger.environments(name).map_err(DeployError::ledger)?;
        let mut count = 0;
        for environment in &environments {
            count += self
                .ledger
                .load(name, environment)
                .map_err(DeployError::ledger)?
                .records
                .len();
        }
        if count == 0 {
            return Ok(0);
        }
        if !force {
            return Err(DeployError::Registry(format!(
                "project '{}' has {} deployment records; pass --force to delete them",
                name, count
            )));
        }

        let mut removed = 0;
        for environment in &environments {
            removed += self
                .ledger
                .clear_records(name, environment)
                .map_err(DeployError::ledger)?;
        }
        drop(guards);
        tracing::info!(project = name, removed, "deployment records reset");
        Ok(removed)
    }

    pub(crate) fn project(&self, name: &str) -> Result<Project, DeployError> {
        self.registry
            .get(name)
            .map_err(|e| DeployError::Registry(format!("{:#}", e)))?
            .ok_or_else(|| DeployError::NotFound(format!("project '{}'", name)))
    }

    pub(crate) fn environment<'p>(
        project: &'p Project,
        environment: &str,
    ) -> Result<&'p EnvironmentEntry, DeployError> {
        project.environment(environment).ok_or_else(|| {
            DeployError::NotFound(format!(
                "environment '{}' of project '{}'",
                environment, project.name
            ))
        })
    }

    pub fn lock_path(&self, project: &str, environment: &str) -> PathBuf {
        self.settings
            .state_dir
            .join("locks")
            .join(project)
            .join(format!("{}.lock", environment))
    }

    /// Take the environment lock without waiting.
    pub(crate) fn lock_environment(
        &self,
        project: &str,
        environment: &str,
        purpose: &str,
    ) -> Result<PathLockGuard, DeployError> {
        let lock = PathLock::new(self.lock_path(project, environment));
        match lock.try_acquire(purpose) {
            Ok(Ok(guard)) => Ok(guard),
            Ok(Err(holder)) => Err(DeployError::DeploymentInProgress {
                project: project.to_string(),
                environment: environment.to_string(),
                holder: holder.to_string(),
            }),
            Err(err) => Err(DeployError::LedgerWrite(format!("{:#}", err))),
        }
    }

    pub fn releases_dir(&self, project: &str, environment: &str) -> PathBuf {
        self.fetcher.releases_dir(project, environment)
    }

    pub fn current_link(&self, project: &str, environment: &str) -> PathBuf {
        self.releases_dir(project, environment).join("current")
    }

    fn log_dir(&self, project: &str, environment: &str) -> PathBuf {
        self.settings
            .apps_dir
            .join(project)
            .join("logs")
            .join(environment)
    }

    fn media_dir(&self, project: &str, environment: &str, release: &Release) -> PathBuf {
        let shared = self
            .settings
            .apps_dir
            .join(project)
            .join("media")
            .join(environment);
        match release.manifest.as_ref().and_then(|m| m.media_dir.as_deref()) {
            Some(dir) => shared.join(dir),
            None => shared,
        }
    }

    fn port_plan(project: &Project, entry: &EnvironmentEntry) -> Result<PortPlan, DeployError> {
        PortPlan::new(project.port_start, entry.slot)
            .map_err(|e| DeployError::Render(format!("{:#}", e)))
    }

    /// Render a ledgered release against the current secrets.
    pub(crate) fn render_release(
        &self,
        project: &Project,
        environment: &str,
        entry: &EnvironmentEntry,
        release: &Release,
    ) -> Result<RenderedRelease, DeployError> {
        let manifest = release.manifest.as_ref().ok_or_else(|| {
            DeployError::Render(format!("release {} has no recorded manifest", release.id))
        })?;
        let runtime_dir = release
            .runtime_dir
            .clone()
            .unwrap_or_else(|| self.provisioner.runtime_dir(&project.name, environment));
        let working_dir = working_dir(&release.path);
        let log_dir = self.log_dir(&project.name, environment);
        let media_dir = self.media_dir(&project.name, environment, release);

        let bindings =
            render::resolve_bindings(manifest, &project.name, environment, &*self.secrets)?;
        render::render(
            &RenderContext {
                project,
                environment,
                env_entry: entry,
                release_id: &release.id,
                release_path: &release.path,
                working_dir: &working_dir,
                runtime_dir: &runtime_dir,
                manifest,
                ports: &release.ports,
                user: &self.settings.deploy_user,
                log_dir: &log_dir,
                media_dir: &media_dir,
            },
            &bindings,
        )
    }

    fn health_targets(&self, release: &Release, rendered: &RenderedRelease) -> Vec<HealthTarget> {
        let services = release
            .manifest
            .as_ref()
            .map(|m| m.services.as_slice())
            .unwrap_or_default();
        rendered
            .supervisor
            .programs
            .iter()
            .map(|program| {
                let check = services
                    .iter()
                    .find(|s| s.name == program.service)
                    .and_then(|s| s.health_check.as_ref());
                HealthTarget {
                    service: program.service.clone(),
                    program: program.name.clone(),
                    port: program.port,
                    endpoint: check
                        .filter(|_| program.port.is_some())
                        .map(|c| c.endpoint.clone()),
                    policy: self.settings.health.for_check(check),
                }
            })
            .collect()
    }
}

/// `<release>/src` when present, otherwise the release root.
pub fn working_dir(release_path: &Path) -> PathBuf {
    let src = release_path.join("src");
    if src.is_dir() {
        src
    } else {
        release_path.to_path_buf()
    }
}
