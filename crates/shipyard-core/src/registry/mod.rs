//! Project and environment registration.
//!
//! Projects are persisted in `projects.toml` under the state directory. Each
//! project owns a deterministic port range, and each of its environments a
//! slot within that range (see [`ports`]).

pub mod ports;
pub mod store;
pub mod types;

pub use ports::{Color, PortPlan};
pub use store::ProjectRegistry;
pub use types::{EnvironmentEntry, Project, ProjectRequest, validate_name};
