//! Release ledger: the durable record of releases and deployment attempts.
//!
//! Each environment has one JSON document holding its releases, its
//! append-only deployment records (dropped only by an explicit reset) and,
//! while a deployment runs, an in-flight marker. The document is replaced atomically, so a status change and the
//! record that explains it always land together. The live release is derived
//! from release statuses on every read; nothing caches it.

mod store;
mod types;

pub use store::{LedgerDocument, ReleaseLedger};
pub use types::{
    DeploymentKind, DeploymentRecord, InFlight, Release, ReleaseStatus, RevisionInfo,
    StepOutcome, StepStatus,
};
