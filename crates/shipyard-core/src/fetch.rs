//! Revision fetcher: resolves a revision and materializes an immutable release
//! directory from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::DeployError;
use crate::fs::{LinkMode, hash_tree, materialize_tree};
use crate::ledger::RevisionInfo;

/// A fetched, exported source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedTree {
    /// Read-only snapshot shared by every release of this commit.
    pub tree: PathBuf,
    pub revision: RevisionInfo,
}

/// Version control collaborator.
///
/// Blocking; callers run it off the async executor.
pub trait VersionControl: Send + Sync {
    /// Fetch `revision` (or the tip of `default_branch`) from `remote`.
    fn fetch(
        &self,
        remote: &str,
        revision: Option<&str>,
        default_branch: &str,
    ) -> anyhow::Result<FetchedTree>;
}

/// A release directory ready for provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedRelease {
    pub id: String,
    pub path: PathBuf,
    pub revision: RevisionInfo,
    pub tree_hash: String,
    pub link_mode: LinkMode,
}

#[derive(Clone)]
pub struct RevisionFetcher {
    vcs: Arc<dyn VersionControl>,
    apps_dir: PathBuf,
    link_mode: LinkMode,
}

impl RevisionFetcher {
    pub fn new(vcs: Arc<dyn VersionControl>, apps_dir: PathBuf, link_mode: LinkMode) -> Self {
        Self {
            vcs,
            apps_dir,
            link_mode,
        }
    }

    /// `<apps>/<project>/releases/<environment>`
    pub fn releases_dir(&self, project: &str, environment: &str) -> PathBuf {
        releases_dir(&self.apps_dir, project, environment)
    }

    /// Fetch and materialize `revision` into a new, uniquely named release
    /// directory. Previous releases are never touched.
    pub async fn materialize(
        &self,
        project: &str,
        environment: &str,
        remote: &str,
        revision: Option<&str>,
        default_branch: &str,
    ) -> Result<MaterializedRelease, DeployError> {
        let this = self.clone();
        let (project, environment, remote) = (
            project.to_string(),
            environment.to_string(),
            remote.to_string(),
        );
        let (revision, default_branch) = (revision.map(str::to_string), default_branch.to_string());

        tokio::task::spawn_blocking(move || {
            this.materialize_blocking(
                &project,
                &environment,
                &remote,
                revision.as_deref(),
                &default_branch,
            )
        })
        .await
        .map_err(|e| DeployError::Fetch(format!("fetch task failed: {}", e)))?
        .map_err(|e| DeployError::Fetch(format!("{:#}", e)))
    }

    fn materialize_blocking(
        &self,
        project: &str,
        environment: &str,
        remote: &str,
        revision: Option<&str>,
        default_branch: &str,
    ) -> anyhow::Result<MaterializedRelease> {
        let fetched = self.vcs.fetch(remote, revision, default_branch)?;
        let dir = self.releases_dir(project, environment);
        let (id, path) = unique_release_dir(&dir, Utc::now(), &fetched.revision)?;

        let report = materialize_tree(&fetched.tree, &path, self.link_mode)?;
        let tree_hash = hash_tree(&path)?;
        tracing::info!(
            project,
            environment,
            release = %id,
            commit = %fetched.revision.short(),
            mode = report.mode.as_str(),
            "release materialized"
        );
        Ok(MaterializedRelease {
            id,
            path,
            revision: fetched.revision,
            tree_hash,
            link_mode: report.mode,
        })
    }
}

pub fn releases_dir(apps_dir: &Path, project: &str, environment: &str) -> PathBuf {
    apps_dir.join(project).join("releases").join(environment)
}

/// `%Y%m%d-%H%M%S-<short sha>`, suffixed when two releases share a second.
fn unique_release_dir(
    dir: &Path,
    now: DateTime<Utc>,
    revision: &RevisionInfo,
) -> anyhow::Result<(String, PathBuf)> {
    let base = format!("{}-{}", now.format("%Y%m%d-%H%M%S"), revision.short());
    let mut id = base.clone();
    for n in 2..100 {
        let path = dir.join(&id);
        if !path.exists() {
            return Ok((id, path));
        }
        id = format!("{}-{}", base, n);
    }
    anyhow::bail!("Could not find a free release directory for {}", base)
}
