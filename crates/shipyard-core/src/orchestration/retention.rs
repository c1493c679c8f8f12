//! Release retention.
//!
//! The newest `keep` non-failed releases stay on disk along with the newest
//! failed one (for inspection). Anything older is retired in the ledger and
//! its directory removed, unless a kept release still shares the directory or
//! its processes may still be running.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::Orchestrator;
use crate::ledger::{LedgerDocument, ReleaseStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RetentionPlan {
    /// Superseded releases to mark retired.
    pub retire: Vec<String>,
    /// Release directories to delete.
    pub remove: Vec<PathBuf>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.retire.is_empty() && self.remove.is_empty()
    }
}

pub(crate) fn plan_retention(doc: &LedgerDocument, keep: usize, releases_dir: &Path) -> RetentionPlan {
    let mut kept: HashSet<&str> = doc
        .releases
        .iter()
        .rev()
        .filter(|r| r.status != ReleaseStatus::Failed)
        .take(keep.max(1))
        .map(|r| r.id.as_str())
        .collect();
    if let Some(failed) = doc
        .releases
        .iter()
        .rev()
        .find(|r| r.status == ReleaseStatus::Failed)
    {
        kept.insert(failed.id.as_str());
    }
    for release in &doc.releases {
        if release.status.may_have_processes() {
            kept.insert(release.id.as_str());
        }
    }

    let protected: HashSet<&Path> = doc
        .releases
        .iter()
        .filter(|r| kept.contains(r.id.as_str()))
        .map(|r| r.path.as_path())
        .collect();

    let mut plan = RetentionPlan::default();
    let mut seen: HashSet<&Path> = HashSet::new();
    for release in doc.releases.iter().filter(|r| !kept.contains(r.id.as_str())) {
        if release.status == ReleaseStatus::Superseded {
            plan.retire.push(release.id.clone());
        }
        let path = release.path.as_path();
        if protected.contains(path) || !seen.insert(path) {
            continue;
        }
        if path.starts_with(releases_dir) && path != releases_dir && path.exists() {
            plan.remove.push(path.to_path_buf());
        }
    }
    plan
}

impl Orchestrator {
    /// Retire and remove releases beyond the retention window.
    pub(crate) fn apply_retention(&self, project: &str, environment: &str) -> anyhow::Result<()> {
        let releases_dir = self.releases_dir(project, environment);
        let keep = self.settings.keep_releases;
        let plan = self.ledger.transact(project, environment, |doc| {
            let plan = plan_retention(doc, keep, &releases_dir);
            for id in &plan.retire {
                doc.set_status(id, ReleaseStatus::Retired)?;
            }
            Ok(plan)
        })?;
        if plan.is_empty() {
            return Ok(());
        }

        for path in &plan.remove {
            match std::fs::remove_dir_all(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed old release"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not remove old release")
                }
            }
        }
        tracing::info!(
            retired = plan.retire.len(),
            removed = plan.remove.len(),
            "release retention applied"
        );
        Ok(())
    }
}
