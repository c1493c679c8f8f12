//! Host-level configuration for the deployer.
//!
//! Loaded from `shipyard.toml` in the user config directory (or an explicit
//! path). A missing file yields the defaults below.

pub mod parser;
pub mod schema;
pub mod store;

pub use parser::{parse_config, parse_config_str, to_toml};
pub use schema::{
    HealthSettings, LockSettings, PathSettings, ReconcileSettings, RetentionSettings,
    RuntimeSettings, ShipyardConfig,
};
pub use store::ConfigStore;
