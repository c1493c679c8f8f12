use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::types::{DeploymentKind, DeploymentRecord, InFlight, Release, ReleaseStatus};
use crate::fs::write_atomic;

const LEDGER_VERSION: u32 = 1;

/// Ledger state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: u32,
    /// Releases in creation order.
    #[serde(default)]
    pub releases: Vec<Release>,
    /// Deployment records in completion order.
    #[serde(default)]
    pub records: Vec<DeploymentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<InFlight>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            releases: Vec::new(),
            records: Vec::new(),
            in_flight: None,
        }
    }
}

impl LedgerDocument {
    /// The live release, if any.
    pub fn current(&self) -> Option<&Release> {
        self.releases
            .iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Live)
    }

    pub fn release(&self, id: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.id == id)
    }

    pub fn release_mut(&mut self, id: &str) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.id == id)
    }

    pub fn contains_release(&self, id: &str) -> bool {
        self.release(id).is_some()
    }

    /// Move a release to `next`, rejecting backward transitions.
    pub fn set_status(&mut self, id: &str, next: ReleaseStatus) -> anyhow::Result<()> {
        let release = self
            .release_mut(id)
            .ok_or_else(|| anyhow::anyhow!("release {} is not in the ledger", id))?;
        if release.status == next {
            return Ok(());
        }
        if !release.status.can_transition_to(next) {
            anyhow::bail!(
                "release {} cannot move from {} to {}",
                id,
                release.status,
                next
            );
        }
        release.status = next;
        Ok(())
    }

    /// Most recent superseded release.
    pub fn rollback_target(&self) -> Option<&Release> {
        self.releases
            .iter()
            .rev()
            .find(|r| r.status == ReleaseStatus::Superseded)
    }

    pub fn last_record(&self) -> Option<&DeploymentRecord> {
        self.records.last()
    }

    /// Most recent record that ended live.
    pub fn last_successful(&self) -> Option<&DeploymentRecord> {
        self.records.iter().rev().find(|r| r.is_live())
    }

    /// Whether the latest attempt failed while an older release still serves.
    pub fn last_attempt_failed(&self) -> bool {
        self.last_record()
            .map(|r| r.status == ReleaseStatus::Failed && r.kind == DeploymentKind::Deploy)
            .unwrap_or(false)
    }

    /// Releases newest first.
    pub fn history(&self, limit: usize) -> Vec<Release> {
        self.releases.iter().rev().take(limit).cloned().collect()
    }

    /// Structural checks run before every write.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let live: Vec<&str> = self
            .releases
            .iter()
            .filter(|r| r.status == ReleaseStatus::Live)
            .map(|r| r.id.as_str())
            .collect();
        if live.len() > 1 {
            anyhow::bail!("more than one live release: {}", live.join(", "));
        }
        if let (Some(current), Some(last)) = (self.current(), self.last_successful())
            && last.release_id.as_deref() != Some(current.id.as_str())
        {
            anyhow::bail!(
                "latest successful record {} points at {:?}, live release is {}",
                last.id,
                last.release_id,
                current.id
            );
        }
        for record in &self.records {
            if record.status == ReleaseStatus::Failed && record.reason.is_none() {
                anyhow::bail!("failed record {} carries no reason", record.id);
            }
        }
        Ok(())
    }
}

/// File-backed ledger: `<state>/ledger/<project>/<environment>.json`.
///
/// Callers mutating an environment's document must hold that environment's
/// deploy lock; readers never lock and always see a complete document.
#[derive(Debug, Clone)]
pub struct ReleaseLedger {
    root: PathBuf,
}

impl ReleaseLedger {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.join("ledger"),
        }
    }

    pub fn document_path(&self, project: &str, environment: &str) -> PathBuf {
        self.root.join(project).join(format!("{}.json", environment))
    }

    pub fn load(&self, project: &str, environment: &str) -> anyhow::Result<LedgerDocument> {
        let path = self.document_path(project, environment);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerDocument::default());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Failed to read ledger: {}", path.display())));
            }
        };
        let doc: LedgerDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse ledger: {}", path.display()))?;
        if doc.version > LEDGER_VERSION {
            anyhow::bail!(
                "Ledger {} has version {}, this build understands up to {}",
                path.display(),
                doc.version,
                LEDGER_VERSION
            );
        }
        Ok(doc)
    }

    /// Apply `change` to the environment's document and persist it atomically.
    ///
    /// Nothing is written when `change` fails or the result violates the
    /// ledger invariants.
    pub fn transact<T>(
        &self,
        project: &str,
        environment: &str,
        change: impl FnOnce(&mut LedgerDocument) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut doc = self.load(project, environment)?;
        let out = change(&mut doc)?;
        doc.check_invariants()
            .with_context(|| format!("Refusing to write ledger for {}/{}", project, environment))?;
        let path = self.document_path(project, environment);
        let body = serde_json::to_vec_pretty(&doc).context("Failed to serialize ledger")?;
        write_atomic(&path, &body)
            .with_context(|| format!("Failed to write ledger: {}", path.display()))?;
        Ok(out)
    }

    /// Append a deployment record.
    pub fn record(&self, record: DeploymentRecord) -> anyhow::Result<()> {
        let (project, environment) = (record.project.clone(), record.environment.clone());
        self.transact(&project, &environment, |doc| {
            if doc.records.iter().any(|r| r.id == record.id) {
                anyhow::bail!("deployment record {} already exists", record.id);
            }
            doc.records.push(record);
            Ok(())
        })
    }

    pub fn current(&self, project: &str, environment: &str) -> anyhow::Result<Option<Release>> {
        Ok(self.load(project, environment)?.current().cloned())
    }

    pub fn history(
        &self,
        project: &str,
        environment: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Release>> {
        Ok(self.load(project, environment)?.history(limit))
    }

    /// Records newest first.
    pub fn records(
        &self,
        project: &str,
        environment: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<DeploymentRecord>> {
        Ok(self
            .load(project, environment)?
            .records
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }

    /// Environments that have a ledger document for `project`.
    pub fn environments(&self, project: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.root.join(project);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut envs = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read ledger directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                envs.push(stem.to_string());
            }
        }
        envs.sort();
        Ok(envs)
    }

    /// Drop the deployment records of one environment, returning how many
    /// were removed. Releases and any in-flight marker stay.
    pub fn clear_records(&self, project: &str, environment: &str) -> anyhow::Result<usize> {
        self.transact(project, environment, |doc| Ok(std::mem::take(&mut doc.records).len()))
    }

    /// Delete every document of a project.
    pub fn remove_project(&self, project: &str) -> anyhow::Result<()> {
        let dir = self.root.join(project);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to remove ledger: {}", dir.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Step;
    use crate::ledger::{RevisionInfo, StepOutcome, StepStatus};
    use crate::registry::Color;
    use chrono::Utc;
    use tempfile::TempDir;

    fn release(id: &str, status: ReleaseStatus) -> Release {
        Release {
            id: id.to_string(),
            project: "checkout".into(),
            environment: "qa".into(),
            revision: RevisionInfo {
                requested: None,
                commit: format!("{}0000000", id),
                message: String::new(),
                author: String::new(),
                committed_at: None,
            },
            path: PathBuf::from(format!("/srv/apps/checkout/releases/qa/{}", id)),
            tree_hash: None,
            status,
            color: Color::Blue,
            manifest: None,
            ports: Default::default(),
            programs: Vec::new(),
            runtime_dir: None,
            rollback_of: None,
            deployed_by: "tester".into(),
            created_at: Utc::now(),
            promoted_at: None,
        }
    }

    fn record(id: &str, release_id: &str, status: ReleaseStatus) -> DeploymentRecord {
        DeploymentRecord {
            id: id.to_string(),
            project: "checkout".into(),
            environment: "qa".into(),
            kind: DeploymentKind::Deploy,
            release_id: Some(release_id.to_string()),
            requested_revision: None,
            initiator: "tester".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status,
            reason: (status == ReleaseStatus::Failed).then(|| "HealthCheckFailed".to_string()),
            message: None,
            steps: vec![StepOutcome {
                step: Step::Commit,
                status: StepStatus::Ok,
                message: None,
                at: Utc::now(),
            }],
        }
    }

    #[test]
    fn missing_document_is_empty() {
        let tmp = TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path());
        assert!(ledger.current("checkout", "qa").unwrap().is_none());
        assert!(ledger.history("checkout", "qa", 10).unwrap().is_empty());
    }

    #[test]
    fn current_follows_live_status() {
        let tmp = TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path());

        ledger
            .transact("checkout", "qa", |doc| {
                doc.releases.push(release("a", ReleaseStatus::Live));
                doc.records.push(record("r1", "a", ReleaseStatus::Live));
                Ok(())
            })
            .unwrap();
        assert_eq!(ledger.current("checkout", "qa").unwrap().unwrap().id, "a");

        ledger
            .transact("checkout", "qa", |doc| {
                doc.releases.push(release("b", ReleaseStatus::Healthy));
                doc.set_status("a", ReleaseStatus::Superseded)?;
                doc.set_status("b", ReleaseStatus::Live)?;
                doc.records.push(record("r2", "b", ReleaseStatus::Live));
                Ok(())
            })
            .unwrap();

        let doc = ledger.load("checkout", "qa").unwrap();
        assert_eq!(doc.current().unwrap().id, "b");
        assert_eq!(doc.rollback_target().unwrap().id, "a");
        let ids: Vec<String> = doc.history(10).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn failed_change_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path());
        ledger
            .transact("checkout", "qa", |doc| {
                doc.releases.push(release("a", ReleaseStatus::Live));
                doc.records.push(record("r1", "a", ReleaseStatus::Live));
                Ok(())
            })
            .unwrap();
        let before = std::fs::read(ledger.document_path("checkout", "qa")).unwrap();

        let err = ledger
            .transact("checkout", "qa", |doc| {
                doc.set_status("a", ReleaseStatus::Failed)?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.to_string().contains("cannot move"));

        let two_live = ledger.transact("checkout", "qa", |doc| {
            doc.releases.push(release("b", ReleaseStatus::Live));
            Ok(())
        });
        assert!(two_live.is_err());

        let after = std::fs::read(ledger.document_path("checkout", "qa")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn record_appends_and_rejects_duplicates() {
        let tmp = TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path());

        ledger
            .record(record("r1", "a", ReleaseStatus::Failed))
            .unwrap();
        assert!(ledger.record(record("r1", "a", ReleaseStatus::Failed)).is_err());

        let doc = ledger.load("checkout", "qa").unwrap();
        assert_eq!(doc.records.len(), 1);
        assert!(doc.last_attempt_failed());
        assert_eq!(ledger.environments("checkout").unwrap(), vec!["qa"]);
    }

    #[test]
    fn clear_records_keeps_releases() {
        let tmp = TempDir::new().unwrap();
        let ledger = ReleaseLedger::new(tmp.path());
        ledger
            .transact("checkout", "qa", |doc| {
                doc.releases.push(release("a", ReleaseStatus::Live));
                doc.records.push(record("r1", "a", ReleaseStatus::Live));
                Ok(())
            })
            .unwrap();
        ledger
            .record(record("r2", "a", ReleaseStatus::Failed))
            .unwrap();

        assert_eq!(ledger.clear_records("checkout", "qa").unwrap(), 2);
        assert_eq!(ledger.clear_records("checkout", "qa").unwrap(), 0);

        let doc = ledger.load("checkout", "qa").unwrap();
        assert!(doc.records.is_empty());
        assert_eq!(doc.current().unwrap().id, "a");
    }
}
