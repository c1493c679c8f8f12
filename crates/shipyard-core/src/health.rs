//! Health gate: decides promote vs. abort for a release running in shadow.
//!
//! Each service is watched independently. A service with a health check is
//! healthy on its first 2xx response; one without a check is healthy once the
//! supervisor reports it running. A service is unhealthy after its budget of
//! consecutive failed probes or when its timeout elapses, whichever is first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::config::HealthSettings;
use crate::error::{DeployError, Step};
use crate::manifest::HealthCheckSpec;
use crate::reconcile::{ProcessSupervisor, ProgramState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// One line per failing service.
    Unhealthy(Vec<String>),
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy)
    }
}

/// Probes one HTTP endpoint on a loopback port.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Status code of `GET http://127.0.0.1:<port><path>`; `Err` on network failure.
    async fn probe(&self, port: u16, path: &str) -> anyhow::Result<u16>;
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, port: u16, path: &str) -> anyhow::Result<u16> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let response = self
            .client
            .get(format!("http://127.0.0.1:{}{}", port, path))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Polling cadence and failure budget for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures tolerated; derived from timeout/interval when unset.
    pub failure_threshold: Option<u32>,
}

impl HealthPolicy {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
            failure_threshold: settings.failure_threshold,
        }
    }

    /// Apply a service's declared interval and timeout on top of the defaults.
    pub fn for_check(self, check: Option<&HealthCheckSpec>) -> Self {
        match check {
            Some(check) => Self {
                interval: Duration::from_secs(check.interval.max(1)),
                timeout: check.timeout.map(Duration::from_secs).unwrap_or(self.timeout),
                failure_threshold: self.failure_threshold,
            },
            None => self,
        }
    }

    pub fn threshold(&self) -> u32 {
        if let Some(n) = self.failure_threshold {
            return n.max(1);
        }
        let interval = self.interval.as_millis().max(1);
        let probes = self.timeout.as_millis().div_ceil(interval);
        u32::try_from(probes).unwrap_or(u32::MAX).max(1)
    }
}

/// One service of a release under watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub service: String,
    pub program: String,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub policy: HealthPolicy,
}

#[derive(Clone)]
pub struct HealthGate {
    probe: Arc<dyn HealthProbe>,
    supervisor: Arc<dyn ProcessSupervisor>,
}

impl HealthGate {
    pub fn new(probe: Arc<dyn HealthProbe>, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self { probe, supervisor }
    }

    /// Watch every target until all are healthy or one is declared unhealthy.
    pub async fn await_healthy(
        &self,
        targets: &[HealthTarget],
        cancel: &CancelToken,
    ) -> Result<HealthOutcome, DeployError> {
        cancel
            .run(Step::HealthGate, async {
                let mut set = JoinSet::new();
                for target in targets.iter().cloned() {
                    let probe = self.probe.clone();
                    let supervisor = self.supervisor.clone();
                    set.spawn(watch(probe, supervisor, target));
                }

                while let Some(joined) = set.join_next().await {
                    let failure = match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(reason)) => reason,
                        Err(err) => format!("health task failed: {}", err),
                    };
                    set.abort_all();
                    tracing::warn!(reason = %failure, "health gate failed");
                    return Ok(HealthOutcome::Unhealthy(vec![failure]));
                }
                Ok(HealthOutcome::Healthy)
            })
            .await
    }
}

async fn watch(
    probe: Arc<dyn HealthProbe>,
    supervisor: Arc<dyn ProcessSupervisor>,
    target: HealthTarget,
) -> Result<(), String> {
    let deadline = Instant::now() + target.policy.timeout;
    let threshold = target.policy.threshold();
    let mut failures = 0u32;

    loop {
        let reason = match check_once(&*probe, &*supervisor, &target).await {
            Ok(()) => {
                tracing::info!(service = %target.service, "service healthy");
                return Ok(());
            }
            Err(reason) => reason,
        };
        failures += 1;
        tracing::debug!(service = %target.service, failures, reason = %reason, "probe failed");

        if failures >= threshold {
            return Err(format!(
                "{}: {} consecutive failed probes (last: {})",
                target.service, failures, reason
            ));
        }
        if Instant::now() + target.policy.interval > deadline {
            return Err(format!(
                "{}: not healthy within {}s (last: {})",
                target.service,
                target.policy.timeout.as_secs(),
                reason
            ));
        }
        tokio::time::sleep(target.policy.interval).await;
    }
}

async fn check_once(
    probe: &dyn HealthProbe,
    supervisor: &dyn ProcessSupervisor,
    target: &HealthTarget,
) -> Result<(), String> {
    match (target.port, target.endpoint.as_deref()) {
        (Some(port), Some(endpoint)) => match probe.probe(port, endpoint).await {
            Ok(code) if (200..300).contains(&code) => Ok(()),
            Ok(code) => Err(format!("HTTP {} from {}", code, endpoint)),
            Err(err) => Err(format!("{:#}", err)),
        },
        _ => match supervisor.status(&target.program).await {
            Ok(ProgramState::Running) => Ok(()),
            Ok(state) => Err(format!("program {} is {}", target.program, state.as_str())),
            Err(err) => Err(format!("{:#}", err)),
        },
    }
}
