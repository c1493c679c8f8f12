//! Error taxonomy for deploy, rollback and registry operations.

use thiserror::Error;

use crate::ledger::DeploymentRecord;

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Lock,
    Fetch,
    Provision,
    Render,
    PreDeployHooks,
    Shadow,
    HealthGate,
    Promote,
    PostDeployHooks,
    Commit,
    SwitchCurrent,
    RetirePrevious,
    Teardown,
    Retention,
    Cleanup,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Lock => "lock",
            Step::Fetch => "fetch",
            Step::Provision => "provision",
            Step::Render => "render",
            Step::PreDeployHooks => "pre_deploy_hooks",
            Step::Shadow => "shadow",
            Step::HealthGate => "health_gate",
            Step::Promote => "promote",
            Step::PostDeployHooks => "post_deploy_hooks",
            Step::Commit => "commit",
            Step::SwitchCurrent => "switch_current",
            Step::RetirePrevious => "retire_previous",
            Step::Teardown => "teardown",
            Step::Retention => "retention",
            Step::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("reconcile failed during {step}: {message}{}", remediation_suffix(.remediation))]
    Reconcile {
        step: Step,
        message: String,
        remediation: Option<String>,
    },

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("deployment already in progress for {project}/{environment} (held by {holder})")]
    DeploymentInProgress {
        project: String,
        environment: String,
        holder: String,
    },

    #[error("no rollback target for {project}/{environment}")]
    NoRollbackTarget { project: String, environment: String },

    #[error("ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("operation cancelled during {0}")]
    Cancelled(Step),

    #[error("{0} not found")]
    NotFound(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),
}

fn remediation_suffix(remediation: &Option<String>) -> String {
    match remediation {
        Some(text) => format!(" (remediation: {})", text),
        None => String::new(),
    }
}

impl DeployError {
    /// Short machine-readable name of the error kind, stored as a record's reason.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Fetch(_) => "FetchError",
            DeployError::Provision(_) => "ProvisionError",
            DeployError::Render(_) => "RenderError",
            DeployError::Reconcile { .. } => "ReconcileError",
            DeployError::HealthCheckFailed(_) => "HealthCheckFailed",
            DeployError::DeploymentInProgress { .. } => "DeploymentInProgress",
            DeployError::NoRollbackTarget { .. } => "NoRollbackTarget",
            DeployError::LedgerWrite(_) => "LedgerWriteError",
            DeployError::Cancelled(_) => "Cancelled",
            DeployError::NotFound(_) => "NotFound",
            DeployError::Registry(_) => "RegistryError",
            DeployError::Config(_) => "ConfigError",
        }
    }

    /// Fatal errors escape to the caller; everything else becomes a failed record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::DeploymentInProgress { .. }
                | DeployError::NoRollbackTarget { .. }
                | DeployError::LedgerWrite(_)
                | DeployError::Reconcile {
                    remediation: Some(_),
                    ..
                }
        )
    }

    pub(crate) fn reconcile(step: Step, err: impl std::fmt::Display) -> Self {
        DeployError::Reconcile {
            step,
            message: format!("{:#}", err),
            remediation: None,
        }
    }

    pub(crate) fn ledger(err: anyhow::Error) -> Self {
        DeployError::LedgerWrite(format!("{:#}", err))
    }
}

/// Outcome handed back to CLI/API callers.
pub type DeployResult = Result<DeploymentRecord, DeployError>;
