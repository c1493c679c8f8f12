//! Git-backed version control.
//!
//! One bare clone per repository URL is cached under the state directory.
//! Commits are exported once into a snapshot cache; release directories are
//! materialized from those snapshots.

mod fetcher;
mod spec;

pub use fetcher::GitFetcher;
pub use spec::RepoSpec;
