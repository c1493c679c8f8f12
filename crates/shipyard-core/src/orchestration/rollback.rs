//! Rollback protocol.
//!
//! Re-promotes the most recent superseded release without fetching,
//! provisioning or health-gating it again. The re-promotion is a new ledger
//! release that shares the target's files and runtime but runs on the ports of
//! the color opposite the live release, so both can be up during the switch.

use chrono::Utc;

use super::Orchestrator;
use super::attempt::Attempt;
use crate::cancel::CancelToken;
use crate::error::{DeployError, DeployResult, Step};
use crate::fs::hash_tree;
use crate::ledger::{DeploymentKind, LedgerDocument, Release, ReleaseStatus, StepStatus};
use crate::reconcile::ApplyMode;
use crate::registry::{EnvironmentEntry, Project};
use crate::render::assign_ports;

impl Orchestrator {
    /// Roll an environment back to its previous live release.
    ///
    /// When the latest deploy failed and an older release is still live, this
    /// is a no-op that records the live release again.
    pub async fn rollback(
        &self,
        project: &str,
        environment: &str,
        initiator: &str,
        cancel: &CancelToken,
    ) -> DeployResult {
        let project = self.project(project)?;
        let entry = Self::environment(&project, environment)?.clone();
        let _guard = self.lock_environment(&project.name, environment, "rollback")?;
        self.ensure_settled(&project.name, environment)?;

        let doc = self
            .ledger
            .load(&project.name, environment)
            .map_err(DeployError::ledger)?;
        let mut attempt = Attempt::new(
            DeploymentKind::Rollback,
            &project.name,
            environment,
            None,
            initiator,
        );

        if doc.last_attempt_failed()
            && let Some(current) = doc.current()
        {
            return self.confirm_current(&mut attempt, current);
        }

        let target = doc
            .rollback_target()
            .cloned()
            .ok_or_else(|| DeployError::NoRollbackTarget {
                project: project.name.clone(),
                environment: environment.to_string(),
            })?;
        let previous = doc.current().cloned();
        tracing::info!(
            project = %project.name,
            environment,
            target = %target.id,
            commit = %target.revision.short(),
            record = %attempt.record_id,
            "rollback started"
        );

        match self
            .run_rollback(&project, &entry, &doc, &target, previous.as_ref(), &mut attempt, cancel)
            .await
        {
            Ok(record) => Ok(record),
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, stage = %attempt.stage, "rollback needs operator attention");
                Err(err)
            }
            Err(err) => {
                tracing::warn!(error = %err, stage = %attempt.stage, "rollback failed, aborting");
                attempt.log(attempt.stage, StepStatus::Failed, Some(err.to_string()));
                let programs = std::mem::take(&mut attempt.shadow_programs);
                if let Err(e) = self.reconciler.teardown(&programs).await {
                    attempt.log(Step::Teardown, StepStatus::Warning, Some(format!("{:#}", e)));
                }
                attempt.commit_failure(&self.ledger, &err)
            }
        }
    }

    /// Append a rollback record that keeps the live release as it is.
    fn confirm_current(&self, attempt: &mut Attempt, current: &Release) -> DeployResult {
        tracing::info!(
            release = %current.id,
            "latest deploy failed; live release unchanged, nothing to roll back"
        );
        attempt.release_id = Some(current.id.clone());
        attempt.log(
            Step::Promote,
            StepStatus::Skipped,
            Some(format!("{} is already live", current.id)),
        );
        let record = attempt.live_record();
        self.ledger
            .record(record.clone())
            .map_err(DeployError::ledger)?;
        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_rollback(
        &self,
        project: &Project,
        entry: &EnvironmentEntry,
        doc: &LedgerDocument,
        target: &Release,
        previous: Option<&Release>,
        attempt: &mut Attempt,
        cancel: &CancelToken,
    ) -> DeployResult {
        let environment = attempt.environment.clone();

        attempt.stage = Step::Render;
        let color = previous
            .map(|r| r.color.other())
            .unwrap_or(target.color);
        let manifest = target.manifest.as_ref().ok_or_else(|| {
            DeployError::Render(format!("release {} has no recorded manifest", target.id))
        })?;
        let plan = Self::port_plan(project, entry)?;
        let ports = assign_ports(manifest, &plan, color)
            .map_err(|e| DeployError::Render(format!("{:#}", e)))?;
        let mut release = Release {
            id: rollback_id(doc, target),
            status: ReleaseStatus::Healthy,
            color,
            ports,
            programs: Vec::new(),
            rollback_of: Some(target.id.clone()),
            deployed_by: attempt.initiator.clone(),
            created_at: Utc::now(),
            promoted_at: None,
            ..target.clone()
        };

        if !release.path.is_dir() {
            return Err(DeployError::Render(format!(
                "release directory {} no longer exists",
                release.path.display()
            )));
        }
        match (&target.tree_hash, hash_tree(&release.path)) {
            (Some(recorded), Ok(actual)) if *recorded != actual => attempt.log(
                Step::Render,
                StepStatus::Warning,
                Some(format!("files of {} changed since release", target.id)),
            ),
            (_, Err(err)) => attempt.log(
                Step::Render,
                StepStatus::Warning,
                Some(format!("could not verify release files: {:#}", err)),
            ),
            _ => {}
        }

        let rendered = self.render_release(project, &environment, entry, &release)?;
        release.programs = rendered.supervisor.program_names();
        attempt.ok(Some(format!(
            "{} ({}, {} program(s))",
            target.revision.short(),
            color,
            release.programs.len()
        )));

        attempt.stage = Step::Promote;
        attempt.release_id = Some(release.id.clone());
        attempt.shadow_programs = release.programs.clone();
        {
            let release = release.clone();
            attempt.persist(&self.ledger, move |doc| {
                doc.releases.push(release);
                Ok(())
            })?;
        }
        let promoted = self
            .reconciler
            .apply(&rendered, ApplyMode::Promote, cancel)
            .await?;
        attempt.ok(promoted.site.map(|site| format!("proxy site {}", site)));
        attempt.log(
            Step::PostDeployHooks,
            StepStatus::Skipped,
            Some("not run on rollback".to_string()),
        );

        attempt.stage = Step::Commit;
        attempt.ok(None);
        let mut retire = vec![target.id.clone()];
        retire.extend(previous.map(|r| r.id.clone()));
        let record = self.commit_live(attempt, &release.id, &retire)?;
        tracing::info!(
            release = %release.id,
            rollback_of = %target.id,
            commit = %release.revision.short(),
            "rollback live"
        );

        self.after_commit(&project.name, &environment, &release.path, previous, cancel)
            .await?;
        Ok(record)
    }
}

/// `<timestamp>-<short sha>-rollback`, suffixed when already taken.
fn rollback_id(doc: &LedgerDocument, target: &Release) -> String {
    let base = format!(
        "{}-{}-rollback",
        Utc::now().format("%Y%m%d-%H%M%S"),
        target.revision.short()
    );
    let mut id = base.clone();
    let mut n = 2;
    while doc.contains_release(&id) {
        id = format!("{}-{}", base, n);
        n += 1;
    }
    id
}
