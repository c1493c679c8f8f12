//! Deploy protocol.
//!
//! lock -> fetch -> provision -> render -> pre-deploy hooks -> shadow ->
//! health gate -> promote -> post-deploy hooks -> commit -> current symlink ->
//! retire previous -> retention.
//!
//! Anything failing before promotion tears the shadow down and ends in a
//! failed record; the live release is never touched on that path.

use std::path::Path;

use chrono::Utc;

use super::Orchestrator;
use super::attempt::Attempt;
use crate::cancel::CancelToken;
use crate::error::{DeployError, DeployResult, Step};
use crate::fs::swap_symlink;
use crate::health::HealthOutcome;
use crate::ledger::{DeploymentKind, DeploymentRecord, Release, ReleaseStatus, StepStatus};
use crate::manifest::Manifest;
use crate::reconcile::ApplyMode;
use crate::registry::{EnvironmentEntry, Project};
use crate::render::assign_ports;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub project: String,
    pub environment: String,
    /// Branch, tag or commit; the project's default branch when unset.
    pub revision: Option<String>,
    pub initiator: String,
}

impl DeployRequest {
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            revision: None,
            initiator: default_initiator(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = initiator.into();
        self
    }
}

/// `$USER`, or `cli` when unset.
pub fn default_initiator() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "cli".to_string())
}

impl Orchestrator {
    /// Deploy a revision to an environment.
    ///
    /// Recoverable failures come back as `Ok` with a failed record; only
    /// lock contention, ledger write failures and partial promotions are `Err`.
    pub async fn deploy(&self, request: DeployRequest, cancel: &CancelToken) -> DeployResult {
        let project = self.project(&request.project)?;
        let entry = Self::environment(&project, &request.environment)?.clone();
        let _guard = self.lock_environment(&project.name, &request.environment, "deploy")?;
        self.ensure_settled(&project.name, &request.environment)?;

        let mut attempt = Attempt::new(
            DeploymentKind::Deploy,
            &project.name,
            &request.environment,
            request.revision.clone(),
            &request.initiator,
        );
        tracing::info!(
            project = %project.name,
            environment = %request.environment,
            revision = request.revision.as_deref().unwrap_or(&project.default_branch),
            record = %attempt.record_id,
            "deploy started"
        );

        match self
            .run_deploy(&project, &entry, &request, &mut attempt, cancel)
            .await
        {
            Ok(record) => Ok(record),
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, stage = %attempt.stage, "deploy needs operator attention");
                Err(err)
            }
            Err(err) => self.abort(&mut attempt, err).await,
        }
    }

    /// Refuse to start while an earlier attempt left its marker behind.
    pub(crate) fn ensure_settled(&self, project: &str, environment: &str) -> Result<(), DeployError> {
        let doc = self
            .ledger
            .load(project, environment)
            .map_err(DeployError::ledger)?;
        match doc.in_flight {
            Some(marker) => Err(DeployError::DeploymentInProgress {
                project: project.to_string(),
                environment: environment.to_string(),
                holder: format!(
                    "unfinished {} {} (pid {}, stage {}); run `shipyard cleanup {} {}`",
                    marker.kind.as_str(),
                    marker.record_id,
                    marker.pid,
                    marker.stage,
                    project,
                    environment
                ),
            }),
            None => Ok(()),
        }
    }

    async fn run_deploy(
        &self,
        project: &Project,
        entry: &EnvironmentEntry,
        request: &DeployRequest,
        attempt: &mut Attempt,
        cancel: &CancelToken,
    ) -> DeployResult {
        let env = request.environment.as_str();

        attempt.enter(&self.ledger, Step::Fetch)?;
        let fetched = cancel
            .run(
                Step::Fetch,
                self.fetcher.materialize(
                    &project.name,
                    env,
                    &project.repository,
                    request.revision.as_deref(),
                    &project.default_branch,
                ),
            )
            .await?;

        let previous = self
            .ledger
            .current(&project.name, env)
            .map_err(DeployError::ledger)?;
        let color = previous
            .as_ref()
            .map(|r| r.color.other())
            .unwrap_or_default();
        let mut release = Release {
            id: fetched.id.clone(),
            project: project.name.clone(),
            environment: env.to_string(),
            revision: fetched.revision.clone(),
            path: fetched.path.clone(),
            tree_hash: Some(fetched.tree_hash.clone()),
            status: ReleaseStatus::Pending,
            color,
            manifest: None,
            ports: Default::default(),
            programs: Vec::new(),
            runtime_dir: None,
            rollback_of: None,
            deployed_by: request.initiator.clone(),
            created_at: Utc::now(),
            promoted_at: None,
        };
        attempt.release_id = Some(release.id.clone());
        {
            let pending = release.clone();
            attempt.persist(&self.ledger, move |doc| {
                doc.releases.push(pending);
                Ok(())
            })?;
        }

        let (manifest_path, manifest) = Manifest::discover(&release.path, env)
            .map_err(|e| DeployError::Render(format!("{:#}", e)))?;
        let plan = Self::port_plan(project, entry)?;
        release.ports = assign_ports(&manifest, &plan, color)
            .map_err(|e| DeployError::Render(format!("{:#}", e)))?;
        release.manifest = Some(manifest.clone());
        attempt.ok(Some(format!(
            "{} -> {} ({}, {})",
            fetched.revision.short(),
            release.id,
            manifest_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            color
        )));

        attempt.stage = Step::Provision;
        self.save_release(attempt, &release)?;
        let working_dir = super::working_dir(&release.path);
        let runtime = self
            .provisioner
            .provision(&project.name, env, &working_dir, &manifest, cancel)
            .await?;
        release.runtime_dir = Some(runtime.dir.clone());
        release.status = ReleaseStatus::Provisioned;
        attempt.ok(Some(format!(
            "python {}{}",
            runtime.version,
            if runtime.installed {
                ", dependencies installed"
            } else {
                ""
            }
        )));

        attempt.stage = Step::Render;
        self.save_release(attempt, &release)?;
        let rendered = self.render_release(project, env, entry, &release)?;
        release.programs = rendered.supervisor.program_names();
        attempt.ok(Some(format!("{} program(s)", release.programs.len())));

        attempt.stage = Step::PreDeployHooks;
        self.save_release(attempt, &release)?;
        if manifest.hooks.pre_deploy.is_empty() {
            attempt.log(Step::PreDeployHooks, StepStatus::Skipped, None);
        } else {
            self.reconciler
                .run_hooks(
                    Step::PreDeployHooks,
                    &manifest.hooks.pre_deploy,
                    &working_dir,
                    &rendered.hook_env,
                    cancel,
                )
                .await?;
            attempt.ok(None);
        }

        // Record the programs before starting them so an interrupted start
        // can still be torn down.
        attempt.stage = Step::Shadow;
        attempt.shadow_programs = release.programs.clone();
        self.save_release(attempt, &release)?;
        self.reconciler
            .apply(&rendered, ApplyMode::Shadow, cancel)
            .await?;
        attempt.ok(Some(format!("ports {}", describe_ports(&release))));

        attempt.enter(&self.ledger, Step::HealthGate)?;
        let targets = self.health_targets(&release, &rendered);
        match self.health.await_healthy(&targets, cancel).await? {
            HealthOutcome::Healthy => attempt.ok(None),
            HealthOutcome::Unhealthy(details) => {
                return Err(DeployError::HealthCheckFailed(details.join("; ")));
            }
        }
        release.status = ReleaseStatus::Healthy;

        attempt.stage = Step::Promote;
        self.save_release(attempt, &release)?;
        let promoted = self
            .reconciler
            .apply(&rendered, ApplyMode::Promote, cancel)
            .await?;
        attempt.ok(promoted.site.map(|site| format!("proxy site {}", site)));

        // Past promotion cancellation no longer applies.
        let settled = CancelToken::new();
        attempt.enter(&self.ledger, Step::PostDeployHooks)?;
        if manifest.hooks.post_deploy.is_empty() {
            attempt.log(Step::PostDeployHooks, StepStatus::Skipped, None);
        } else {
            match self
                .reconciler
                .run_hooks(
                    Step::PostDeployHooks,
                    &manifest.hooks.post_deploy,
                    &working_dir,
                    &rendered.hook_env,
                    &settled,
                )
                .await
            {
                Ok(()) => attempt.ok(None),
                Err(err) => {
                    tracing::warn!(error = %err, "post-deploy hook failed");
                    attempt.log(Step::PostDeployHooks, StepStatus::Warning, Some(err.to_string()));
                }
            }
        }

        attempt.stage = Step::Commit;
        attempt.ok(None);
        let record = self.commit_live(attempt, &release.id, &[])?;
        tracing::info!(release = %release.id, commit = %release.revision.short(), "release live");

        self.after_commit(&project.name, env, &release.path, previous.as_ref(), cancel)
            .await?;
        Ok(record)
    }

    /// Write the release under attempt back to the ledger with the marker.
    fn save_release(&self, attempt: &Attempt, release: &Release) -> Result<(), DeployError> {
        let release = release.clone();
        attempt.persist(&self.ledger, move |doc| {
            let slot = doc
                .release_mut(&release.id)
                .ok_or_else(|| anyhow::anyhow!("release {} is not in the ledger", release.id))?;
            *slot = release;
            Ok(())
        })
    }

    /// Make `release_id` live in one transaction: the previous live release is
    /// superseded, `retire` releases are retired, the record is appended and
    /// the in-flight marker cleared.
    pub(crate) fn commit_live(
        &self,
        attempt: &Attempt,
        release_id: &str,
        retire: &[String],
    ) -> Result<DeploymentRecord, DeployError> {
        let record = attempt.live_record();
        let now = Utc::now();
        self.ledger
            .transact(&attempt.project, &attempt.environment, |doc| {
                if let Some(previous) = doc.current().map(|r| r.id.clone()) {
                    let next = if retire.contains(&previous) {
                        ReleaseStatus::Retired
                    } else {
                        ReleaseStatus::Superseded
                    };
                    doc.set_status(&previous, next)?;
                }
                for id in retire {
                    doc.set_status(id, ReleaseStatus::Retired)?;
                }
                doc.set_status(release_id, ReleaseStatus::Live)?;
                if let Some(release) = doc.release_mut(release_id) {
                    release.promoted_at = Some(now);
                }
                doc.records.push(record.clone());
                doc.in_flight = None;
                Ok(())
            })
            .map_err(DeployError::ledger)?;
        Ok(record)
    }

    /// Post-commit housekeeping: repoint `current`, stop the previous release
    /// after the grace period, prune old releases.
    pub(crate) async fn after_commit(
        &self,
        project: &str,
        environment: &str,
        live_path: &Path,
        previous: Option<&Release>,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        let link = self.current_link(project, environment);
        if let Err(err) = swap_symlink(live_path, &link) {
            tracing::warn!(
                link = %link.display(),
                error = %format!("{:#}", err),
                "current symlink not updated; `shipyard cleanup` repairs it"
            );
        }

        if let Some(previous) = previous {
            tracing::info!(
                release = %previous.id,
                grace_secs = self.settings.grace_period.as_secs(),
                "retiring previous release"
            );
            self.reconciler
                .retire(&previous.programs, self.settings.grace_period, cancel)
                .await?;
        }

        if let Err(err) = self.apply_retention(project, environment) {
            tracing::warn!(error = %format!("{:#}", err), "release retention failed");
        }
        Ok(())
    }

    /// Abort path for recoverable failures.
    async fn abort(&self, attempt: &mut Attempt, err: DeployError) -> DeployResult {
        tracing::warn!(error = %err, stage = %attempt.stage, "deployment failed, aborting");
        attempt.log(attempt.stage, StepStatus::Failed, Some(err.to_string()));

        let programs = std::mem::take(&mut attempt.shadow_programs);
        let teardown = self.reconciler.teardown(&programs).await;
        match &teardown {
            Ok(()) if !programs.is_empty() => attempt.log(
                Step::Teardown,
                StepStatus::Ok,
                Some(format!("stopped {}", programs.join(", "))),
            ),
            Ok(()) => {}
            Err(e) => attempt.log(Step::Teardown, StepStatus::Warning, Some(format!("{:#}", e))),
        }

        let record = attempt.commit_failure(&self.ledger, &err)?;
        if let Err(e) = teardown {
            return Err(DeployError::Reconcile {
                step: Step::Teardown,
                message: format!("{:#}", e),
                remediation: Some(format!(
                    "stop the shadow programs ({}) with supervisorctl",
                    programs.join(", ")
                )),
            });
        }
        Ok(record)
    }
}

fn describe_ports(release: &Release) -> String {
    if release.ports.is_empty() {
        return "none".to_string();
    }
    release
        .ports
        .iter()
        .map(|(service, port)| format!("{}={}", service, port))
        .collect::<Vec<_>>()
        .join(", ")
}
