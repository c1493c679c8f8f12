//! Shipyard Core Library
//!
//! Release orchestration for self-hosted applications: fetches a revision,
//! provisions its runtime, brings it up beside the live release, gates it on
//! health and switches traffic, keeping a durable ledger of what is live.

pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod git;
pub mod health;
pub mod ledger;
pub mod manifest;
pub mod orchestration;
pub mod provision;
pub mod reconcile;
pub mod registry;
pub mod render;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ConfigStore, ShipyardConfig};
    pub use crate::context::AppContext;

    // Orchestration
    pub use crate::cancel::CancelToken;
    pub use crate::error::{DeployError, DeployResult, Step};
    pub use crate::orchestration::{
        CleanupReport, Collaborators, DeployRequest, EnvironmentStatus, Orchestrator,
        OrchestratorSettings,
    };

    // Ledger
    pub use crate::ledger::{
        DeploymentKind, DeploymentRecord, Release, ReleaseLedger, ReleaseStatus, StepStatus,
    };

    // Registry
    pub use crate::registry::{Color, EnvironmentEntry, Project, ProjectRequest};

    // Collaborator seams
    pub use crate::fetch::VersionControl;
    pub use crate::health::HealthProbe;
    pub use crate::provision::RuntimeInstaller;
    pub use crate::reconcile::{ProcessSupervisor, ProgramState, ReverseProxy};
    pub use crate::render::SecretStore;

    // Filesystem
    pub use crate::fs::LinkMode;
}
