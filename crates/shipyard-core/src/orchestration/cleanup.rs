//! Operator escape hatch for stuck environments.
//!
//! Never runs implicitly. Reclaims a stale lock, closes out an in-flight
//! attempt whose process is gone, restores traffic to the ledger's live
//! release when the attempt died mid-promotion, and repairs the `current`
//! symlink.

use chrono::Utc;
use serde::Serialize;

use super::Orchestrator;
use crate::cancel::CancelToken;
use crate::error::{DeployError, Step};
use crate::fs::{LockHolder, PathLock, is_process_alive, swap_symlink};
use crate::ledger::{DeploymentRecord, InFlight, ReleaseStatus, StepOutcome, StepStatus};
use crate::reconcile::ApplyMode;
use crate::registry::Project;
use crate::render;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Holder of a lock that was removed as stale.
    pub reclaimed_lock: Option<LockHolder>,
    /// Failed record written for an abandoned attempt.
    pub abandoned: Option<DeploymentRecord>,
    /// Live release re-promoted after an interrupted promotion.
    pub repromoted: Option<String>,
    pub torn_down: Vec<String>,
    pub symlink_repaired: bool,
}

impl CleanupReport {
    pub fn is_noop(&self) -> bool {
        self.reclaimed_lock.is_none()
            && self.abandoned.is_none()
            && self.repromoted.is_none()
            && self.torn_down.is_empty()
            && !self.symlink_repaired
    }
}

impl Orchestrator {
    pub async fn cleanup(&self, project: &str, environment: &str) -> Result<CleanupReport, DeployError> {
        let project = self.project(project)?;
        Self::environment(&project, environment)?;
        let mut report = CleanupReport::default();

        let lock = PathLock::new(self.lock_path(&project.name, environment));
        report.reclaimed_lock = lock
            .reclaim_if_stale(self.settings.stale_after)
            .map_err(|e| DeployError::LedgerWrite(format!("{:#}", e)))?;
        let _guard = self.lock_environment(&project.name, environment, "cleanup")?;

        let doc = self
            .ledger
            .load(&project.name, environment)
            .map_err(DeployError::ledger)?;
        if let Some(marker) = doc.in_flight.clone() {
            self.ensure_abandoned(&project.name, environment, &marker)?;
            tracing::warn!(
                project = %project.name,
                environment,
                record = %marker.record_id,
                stage = %marker.stage,
                pid = marker.pid,
                "closing out abandoned attempt"
            );

            if marker.reached_promotion() {
                report.repromoted = self.repromote(&project, environment).await?;
            }
            self.reconciler
                .teardown(&marker.shadow_programs)
                .await
                .map_err(|e| DeployError::Reconcile {
                    step: Step::Cleanup,
                    message: format!("{:#}", e),
                    remediation: Some(format!(
                        "stop the abandoned programs ({}) with supervisorctl",
                        marker.shadow_programs.join(", ")
                    )),
                })?;
            report.torn_down = marker.shadow_programs.clone();
            report.abandoned = Some(self.close_out(&project.name, environment, &marker)?);
        }

        report.symlink_repaired = self.repair_current_link(&project.name, environment)?;
        if report.is_noop() {
            tracing::info!(project = %project.name, environment, "nothing to clean up");
        }
        Ok(report)
    }

    /// An in-flight marker is only closed out once its process is gone or it
    /// has not moved for longer than the staleness threshold.
    fn ensure_abandoned(
        &self,
        project: &str,
        environment: &str,
        marker: &InFlight,
    ) -> Result<(), DeployError> {
        let age = Utc::now()
            .signed_duration_since(marker.updated_at)
            .to_std()
            .unwrap_or_default();
        let own = marker.pid == std::process::id();
        if (!own && !is_process_alive(marker.pid)) || age >= self.settings.stale_after {
            return Ok(());
        }
        Err(DeployError::DeploymentInProgress {
            project: project.to_string(),
            environment: environment.to_string(),
            holder: format!(
                "{} {} by pid {} at stage {} (updated {}s ago)",
                marker.kind.as_str(),
                marker.record_id,
                marker.pid,
                marker.stage,
                age.as_secs()
            ),
        })
    }

    /// Point the supervisor and proxy back at the ledger's live release.
    async fn repromote(&self, project: &Project, environment: &str) -> Result<Option<String>, DeployError> {
        let current = self
            .ledger
            .current(&project.name, environment)
            .map_err(DeployError::ledger)?;
        let Some(current) = current else {
            self.reconciler
                .proxy()
                .remove(&render::site_name(&project.name, environment))
                .await
                .map_err(|e| DeployError::Reconcile {
                    step: Step::Cleanup,
                    message: format!("{:#}", e),
                    remediation: Some("remove the proxy site by hand and reload the proxy".into()),
                })?;
            return Ok(None);
        };

        let entry = Self::environment(project, environment)?;
        let rendered = self.render_release(project, environment, entry, &current)?;
        self.reconciler
            .apply(&rendered, ApplyMode::Promote, &CancelToken::new())
            .await
            .map_err(|e| match e {
                fatal @ DeployError::Reconcile {
                    remediation: Some(_),
                    ..
                } => fatal,
                other => DeployError::Reconcile {
                    step: Step::Cleanup,
                    message: other.to_string(),
                    remediation: Some(format!(
                        "restore the proxy site for release {} by hand",
                        current.id
                    )),
                },
            })?;
        tracing::info!(release = %current.id, "live release re-promoted");
        Ok(Some(current.id))
    }

    fn close_out(
        &self,
        project: &str,
        environment: &str,
        marker: &InFlight,
    ) -> Result<DeploymentRecord, DeployError> {
        let now = Utc::now();
        let message = format!(
            "abandoned at stage {} by cleanup (pid {})",
            marker.stage, marker.pid
        );
        let record = DeploymentRecord {
            id: marker.record_id.clone(),
            project: project.to_string(),
            environment: environment.to_string(),
            kind: marker.kind,
            release_id: marker.release_id.clone(),
            requested_revision: marker.requested_revision.clone(),
            initiator: marker.initiator.clone(),
            started_at: marker.started_at,
            finished_at: now,
            status: ReleaseStatus::Failed,
            reason: Some("Abandoned".to_string()),
            message: Some(message.clone()),
            steps: vec![
                StepOutcome {
                    step: marker.stage,
                    status: StepStatus::Failed,
                    message: Some(message),
                    at: now,
                },
                StepOutcome {
                    step: Step::Cleanup,
                    status: StepStatus::Ok,
                    message: None,
                    at: now,
                },
            ],
        };

        self.ledger
            .transact(project, environment, |doc| {
                if let Some(id) = &marker.release_id
                    && let Some(release) = doc.release(id)
                    && release.status.can_transition_to(ReleaseStatus::Failed)
                {
                    doc.set_status(id, ReleaseStatus::Failed)?;
                }
                doc.records.push(record.clone());
                doc.in_flight = None;
                Ok(())
            })
            .map_err(DeployError::ledger)?;
        Ok(record)
    }

    /// Repoint `current` at the live release when it drifted.
    fn repair_current_link(&self, project: &str, environment: &str) -> Result<bool, DeployError> {
        let Some(current) = self
            .ledger
            .current(project, environment)
            .map_err(DeployError::ledger)?
        else {
            return Ok(false);
        };
        let link = self.current_link(project, environment);
        if std::fs::read_link(&link).ok().as_deref() == Some(current.path.as_path()) {
            return Ok(false);
        }
        swap_symlink(&current.path, &link).map_err(|e| DeployError::Reconcile {
            step: Step::Cleanup,
            message: format!("{:#}", e),
            remediation: Some(format!(
                "point {} at {} by hand",
                link.display(),
                current.path.display()
            )),
        })?;
        tracing::info!(link = %link.display(), release = %current.id, "current symlink repaired");
        Ok(true)
    }
}
