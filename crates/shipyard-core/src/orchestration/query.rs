//! Read-only views over the registry and ledger. None of these take a lock.

use serde::Serialize;

use super::Orchestrator;
use crate::error::DeployError;
use crate::ledger::{DeploymentRecord, InFlight, Release};
use crate::reconcile::ProgramState;

/// What an environment is serving right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentStatus {
    pub project: String,
    pub environment: String,
    pub current: Option<Release>,
    pub programs: Vec<(String, ProgramState)>,
    pub in_flight: Option<InFlight>,
    pub last_record: Option<DeploymentRecord>,
}

impl Orchestrator {
    /// Deployment records newest first, optionally narrowed to one project
    /// and/or environment name.
    pub fn list_deployments(
        &self,
        project: Option<&str>,
        environment: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, DeployError> {
        let projects = match project {
            Some(name) => vec![self.project(name)?],
            None => self
                .registry
                .list()
                .map_err(|e| DeployError::Registry(format!("{:#}", e)))?,
        };

        let mut records = Vec::new();
        for project in &projects {
            for env in project.environments.keys() {
                if environment.is_some_and(|wanted| wanted != env) {
                    continue;
                }
                records.extend(
                    self.ledger
                        .records(&project.name, env, limit)
                        .map_err(DeployError::ledger)?,
                );
            }
        }
        records.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        records.truncate(limit);
        Ok(records)
    }

    pub async fn status(&self, project: &str, environment: &str) -> Result<EnvironmentStatus, DeployError> {
        let project = self.project(project)?;
        Self::environment(&project, environment)?;
        let doc = self
            .ledger
            .load(&project.name, environment)
            .map_err(DeployError::ledger)?;
        let current = doc.current().cloned();
        let programs = match &current {
            Some(release) => self.reconciler.program_states(&release.programs).await,
            None => Vec::new(),
        };
        Ok(EnvironmentStatus {
            project: project.name.clone(),
            environment: environment.to_string(),
            current,
            programs,
            in_flight: doc.in_flight.clone(),
            last_record: doc.last_record().cloned(),
        })
    }

    /// Releases of an environment, newest first.
    pub fn history(
        &self,
        project: &str,
        environment: &str,
        limit: usize,
    ) -> Result<Vec<Release>, DeployError> {
        let project = self.project(project)?;
        Self::environment(&project, environment)?;
        self.ledger
            .history(&project.name, environment, limit)
            .map_err(DeployError::ledger)
    }
}
