use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Step;
use crate::manifest::Manifest;
use crate::registry::Color;

/// Lifecycle of a release.
///
/// `pending -> provisioned -> healthy -> live -> superseded -> retired`, with
/// `live -> retired` allowed directly and `failed` reachable from any state
/// before `live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Pending,
    Provisioned,
    Healthy,
    Live,
    Failed,
    Superseded,
    Retired,
}

impl ReleaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Provisioned => "provisioned",
            ReleaseStatus::Healthy => "healthy",
            ReleaseStatus::Live => "live",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Retired => "retired",
        }
    }

    pub fn can_transition_to(self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioned)
                | (Provisioned, Healthy)
                | (Healthy, Live)
                | (Live, Superseded)
                | (Live, Retired)
                | (Superseded, Retired)
                | (Pending | Provisioned | Healthy, Failed)
        )
    }

    /// Statuses whose processes may still be running under the supervisor.
    pub fn may_have_processes(self) -> bool {
        matches!(
            self,
            ReleaseStatus::Healthy | ReleaseStatus::Live | ReleaseStatus::Provisioned
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved source revision of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Revision as requested by the caller (branch, tag, sha), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<String>,
    pub commit: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl RevisionInfo {
    pub fn short(&self) -> &str {
        &self.commit[..self.commit.len().min(7)]
    }
}

/// One materialization of a revision for an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub revision: RevisionInfo,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_hash: Option<String>,
    pub status: ReleaseStatus,
    pub color: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    /// Port per service name.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// Supervisor programs registered for this release.
    #[serde(default)]
    pub programs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,
    /// Release this one re-promotes, when created by a rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
    pub deployed_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

impl DeploymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentKind::Deploy => "deploy",
            DeploymentKind::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Ok,
    Failed,
    /// Step failed but did not change the outcome (post-deploy hooks, retention).
    Warning,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: Step,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only record of one deploy or rollback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub project: String,
    pub environment: String,
    pub kind: DeploymentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_revision: Option<String>,
    pub initiator: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Terminal status: `live` or `failed`.
    pub status: ReleaseStatus,
    /// Error kind of the first failing step, e.g. `HealthCheckFailed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepOutcome>,
}

impl DeploymentRecord {
    pub fn is_live(&self) -> bool {
        self.status == ReleaseStatus::Live
    }

    /// First step that failed, if any.
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }
}

/// Marker for a deployment that has not yet reached its terminal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub record_id: String,
    pub kind: DeploymentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_revision: Option<String>,
    pub initiator: String,
    pub pid: u32,
    pub stage: Step,
    /// Shadow programs started so far; torn down if the attempt is abandoned.
    #[serde(default)]
    pub shadow_programs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InFlight {
    /// Whether traffic may already point at the in-flight release.
    pub fn reached_promotion(&self) -> bool {
        matches!(
            self.stage,
            Step::Promote | Step::PostDeployHooks | Step::Commit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReleaseStatus::*;

    #[test]
    fn forward_transitions_only() {
        assert!(Pending.can_transition_to(Provisioned));
        assert!(Healthy.can_transition_to(Live));
        assert!(Live.can_transition_to(Superseded));
        assert!(Superseded.can_transition_to(Retired));

        assert!(!Live.can_transition_to(Healthy));
        assert!(!Superseded.can_transition_to(Live));
        assert!(!Retired.can_transition_to(Live));
        assert!(!Pending.can_transition_to(Live));
    }

    #[test]
    fn failure_only_before_live() {
        assert!(Pending.can_transition_to(Failed));
        assert!(Healthy.can_transition_to(Failed));
        assert!(!Live.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Superseded).unwrap(), "\"superseded\"");
    }
}
