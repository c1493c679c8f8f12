//! Reconciler: pushes rendered configuration to the supervisor and proxy.
//!
//! Shadow mode installs and starts a release's programs on their own ports
//! without touching routing. Promote mode makes sure the programs are
//! installed, then switches the proxy site to the release's ports. Control
//! commands are retried inside the adapters; a proxy that rejects its config
//! is rolled back there too, so a rejected promotion leaves routing as it was.

pub mod command;
pub mod hooks;
pub mod proxy;
pub mod retry;
pub mod supervisor;

pub use hooks::HookRunner;
pub use proxy::{NginxProxy, ProxyError, ReverseProxy};
pub use retry::RetryPolicy;
pub use supervisor::{ProcessSupervisor, ProgramState, SupervisorCtl};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{DeployError, Step};
use crate::render::RenderedRelease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Shadow,
    Promote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub mode: ApplyMode,
    pub programs: Vec<String>,
    /// Proxy site switched by a promotion.
    pub site: Option<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    supervisor: Arc<dyn ProcessSupervisor>,
    proxy: Arc<dyn ReverseProxy>,
    hooks: HookRunner,
}

impl Reconciler {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        proxy: Arc<dyn ReverseProxy>,
        hooks: HookRunner,
    ) -> Self {
        Self {
            supervisor,
            proxy,
            hooks,
        }
    }

    pub fn supervisor(&self) -> &Arc<dyn ProcessSupervisor> {
        &self.supervisor
    }

    pub fn proxy(&self) -> &Arc<dyn ReverseProxy> {
        &self.proxy
    }

    pub async fn apply(
        &self,
        rendered: &RenderedRelease,
        mode: ApplyMode,
        cancel: &CancelToken,
    ) -> Result<ReconcileResult, DeployError> {
        let programs = rendered.supervisor.program_names();
        match mode {
            ApplyMode::Shadow => {
                cancel
                    .run(Step::Shadow, async {
                        self.supervisor
                            .apply(&rendered.supervisor.programs)
                            .await
                            .map_err(|e| DeployError::reconcile(Step::Shadow, e))
                    })
                    .await?;
                tracing::info!(programs = ?programs, "shadow programs started");
                Ok(ReconcileResult {
                    mode,
                    programs,
                    site: None,
                })
            }
            ApplyMode::Promote => {
                // Last point at which cancellation is honoured.
                cancel.check(Step::Promote)?;
                self.supervisor
                    .apply(&rendered.supervisor.programs)
                    .await
                    .map_err(|e| DeployError::reconcile(Step::Promote, e))?;

                let site = match &rendered.proxy {
                    Some(config) => {
                        self.proxy
                            .apply(config)
                            .await
                            .map_err(|e| promotion_error(&config.site, e))?;
                        tracing::info!(site = %config.site, ports = ?config.ports, "proxy promoted");
                        Some(config.site.clone())
                    }
                    None => None,
                };
                Ok(ReconcileResult {
                    mode,
                    programs,
                    site,
                })
            }
        }
    }

    /// Stop and remove programs immediately.
    pub async fn teardown(&self, programs: &[String]) -> anyhow::Result<()> {
        if programs.is_empty() {
            return Ok(());
        }
        tracing::info!(programs = ?programs, "tearing down programs");
        self.supervisor.remove(programs).await
    }

    /// Stop a superseded release's programs once `grace` has passed.
    ///
    /// Cancellation shortens the wait but never skips the stop.
    pub async fn retire(
        &self,
        programs: &[String],
        grace: Duration,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        if programs.is_empty() {
            return Ok(());
        }
        if !grace.is_zero() && !cancel.sleep(grace).await {
            tracing::info!("grace period cut short by cancellation");
        }
        self.supervisor
            .remove(programs)
            .await
            .map_err(|e| DeployError::Reconcile {
                step: Step::RetirePrevious,
                message: format!("{:#}", e),
                remediation: Some(format!(
                    "stop the previous release's programs ({}) with supervisorctl",
                    programs.join(", ")
                )),
            })
    }

    pub async fn run_hooks(
        &self,
        step: Step,
        commands: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<(), DeployError> {
        if commands.is_empty() {
            return Ok(());
        }
        cancel
            .run(step, async {
                self.hooks
                    .run(step.as_str(), commands, cwd, env)
                    .await
                    .map_err(|e| DeployError::reconcile(step, e))
            })
            .await
    }

    pub async fn program_states(&self, programs: &[String]) -> Vec<(String, ProgramState)> {
        let mut states = Vec::with_capacity(programs.len());
        for name in programs {
            let state = match self.supervisor.status(name).await {
                Ok(state) => state,
                Err(err) => {
                    tracing::debug!(program = %name, error = %err, "status query failed");
                    ProgramState::Unknown
                }
            };
            states.push((name.clone(), state));
        }
        states
    }
}

fn promotion_error(site: &str, err: ProxyError) -> DeployError {
    match err {
        ProxyError::Rejected(msg) | ProxyError::Unavailable(msg) => {
            DeployError::reconcile(Step::Promote, msg)
        }
        ProxyError::Partial(msg) => DeployError::Reconcile {
            step: Step::Promote,
            message: msg,
            remediation: Some(format!(
                "check the proxy site '{}' and its reload, then run `shipyard cleanup` to re-promote the recorded release",
                site
            )),
        },
    }
}
