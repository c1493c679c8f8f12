//! Bookkeeping for one deploy or rollback while it runs.

use chrono::{DateTime, Utc};

use crate::error::{DeployError, Step};
use crate::ledger::{
    DeploymentKind, DeploymentRecord, InFlight, LedgerDocument, ReleaseLedger, ReleaseStatus,
    StepOutcome, StepStatus,
};

#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub record_id: String,
    pub kind: DeploymentKind,
    pub project: String,
    pub environment: String,
    pub requested_revision: Option<String>,
    pub initiator: String,
    pub started_at: DateTime<Utc>,
    pub stage: Step,
    pub release_id: Option<String>,
    /// Programs started for the release under attempt.
    pub shadow_programs: Vec<String>,
    pub steps: Vec<StepOutcome>,
}

impl Attempt {
    pub fn new(
        kind: DeploymentKind,
        project: &str,
        environment: &str,
        requested_revision: Option<String>,
        initiator: &str,
    ) -> Self {
        Self {
            record_id: ulid::Ulid::new().to_string(),
            kind,
            project: project.to_string(),
            environment: environment.to_string(),
            requested_revision,
            initiator: initiator.to_string(),
            started_at: Utc::now(),
            stage: Step::Lock,
            release_id: None,
            shadow_programs: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn in_flight(&self) -> InFlight {
        InFlight {
            record_id: self.record_id.clone(),
            kind: self.kind,
            release_id: self.release_id.clone(),
            requested_revision: self.requested_revision.clone(),
            initiator: self.initiator.clone(),
            pid: std::process::id(),
            stage: self.stage,
            shadow_programs: self.shadow_programs.clone(),
            started_at: self.started_at,
            updated_at: Utc::now(),
        }
    }

    pub fn log(&mut self, step: Step, status: StepStatus, message: Option<String>) {
        self.steps.push(StepOutcome {
            step,
            status,
            message,
            at: Utc::now(),
        });
    }

    /// Mark the current stage done.
    pub fn ok(&mut self, message: Option<String>) {
        self.log(self.stage, StepStatus::Ok, message);
    }

    pub fn live_record(&self) -> DeploymentRecord {
        self.record(ReleaseStatus::Live, None, None)
    }

    pub fn failed_record(&self, err: &DeployError) -> DeploymentRecord {
        self.record(
            ReleaseStatus::Failed,
            Some(err.kind().to_string()),
            Some(err.to_string()),
        )
    }

    pub fn record(
        &self,
        status: ReleaseStatus,
        reason: Option<String>,
        message: Option<String>,
    ) -> DeploymentRecord {
        DeploymentRecord {
            id: self.record_id.clone(),
            project: self.project.clone(),
            environment: self.environment.clone(),
            kind: self.kind,
            release_id: self.release_id.clone(),
            requested_revision: self.requested_revision.clone(),
            initiator: self.initiator.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            reason,
            message,
            steps: self.steps.clone(),
        }
    }

    /// Enter `stage` and persist the in-flight marker.
    pub fn enter(&mut self, ledger: &ReleaseLedger, stage: Step) -> Result<(), DeployError> {
        self.stage = stage;
        self.persist(ledger, |_| Ok(()))
    }

    /// Persist the marker together with `change` in one ledger transaction.
    pub fn persist(
        &self,
        ledger: &ReleaseLedger,
        change: impl FnOnce(&mut LedgerDocument) -> anyhow::Result<()>,
    ) -> Result<(), DeployError> {
        let marker = self.in_flight();
        ledger
            .transact(&self.project, &self.environment, |doc| {
                change(doc)?;
                doc.in_flight = Some(marker);
                Ok(())
            })
            .map_err(DeployError::ledger)
    }

    /// Record a failed outcome, fail the release under attempt and clear the marker.
    pub fn commit_failure(
        &self,
        ledger: &ReleaseLedger,
        err: &DeployError,
    ) -> Result<DeploymentRecord, DeployError> {
        let record = self.failed_record(err);
        let release_id = self.release_id.clone();
        ledger
            .transact(&self.project, &self.environment, |doc| {
                if let Some(id) = &release_id
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
}
