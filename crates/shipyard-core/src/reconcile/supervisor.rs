//! Process supervisor collaborator and its supervisord implementation.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::command::run_argv;
use super::retry::RetryPolicy;
use crate::fs::write_atomic;
use crate::render::ProgramDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramState {
    Running,
    Starting,
    Stopped,
    /// Gave up restarting (`FATAL`, `BACKOFF`, `EXITED`).
    Failed,
    Unknown,
}

impl ProgramState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramState::Running => "running",
            ProgramState::Starting => "starting",
            ProgramState::Stopped => "stopped",
            ProgramState::Failed => "failed",
            ProgramState::Unknown => "unknown",
        }
    }
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Install the programs and start them.
    async fn apply(&self, programs: &[ProgramDefinition]) -> anyhow::Result<()>;

    /// Stop the named programs and drop their definitions. Unknown names are ignored.
    async fn remove(&self, names: &[String]) -> anyhow::Result<()>;

    /// Re-read definitions and reconcile running processes with them.
    async fn reload(&self) -> anyhow::Result<()>;

    async fn status(&self, name: &str) -> anyhow::Result<ProgramState>;
}

/// supervisord driven through `supervisorctl`, one `<program>.conf` per program.
#[derive(Debug, Clone)]
pub struct SupervisorCtl {
    conf_dir: PathBuf,
    command: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SupervisorCtl {
    pub fn new(conf_dir: PathBuf, command: Vec<String>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            conf_dir,
            command,
            retry,
            timeout,
        }
    }

    pub fn conf_path(&self, name: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", name))
    }

    async fn ctl(&self, args: &[&str]) -> anyhow::Result<super::command::CommandOutput> {
        let mut argv = self.command.clone();
        argv.extend(args.iter().map(|a| a.to_string()));
        run_argv(&argv, self.timeout).await
    }

    async fn ctl_ok(&self, args: &[&str]) -> anyhow::Result<()> {
        let out = self.ctl(args).await?;
        // supervisorctl exits 0 on many errors; check the text too.
        if !out.success || reports_error(&out.stdout) || reports_error(&out.stderr) {
            anyhow::bail!("supervisorctl {} failed: {}", args.join(" "), out.diagnostics());
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSupervisor for SupervisorCtl {
    async fn apply(&self, programs: &[ProgramDefinition]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.conf_dir).with_context(|| {
            format!(
                "Failed to create supervisor config dir: {}",
                self.conf_dir.display()
            )
        })?;
        for program in programs {
            for log in [&program.stdout_log, &program.stderr_log] {
                if let Some(parent) = log.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create log dir: {}", parent.display())
                    })?;
                }
            }
            write_atomic(&self.conf_path(&program.name), program.to_conf().as_bytes())?;
        }
        self.reload().await
    }

    async fn remove(&self, names: &[String]) -> anyhow::Result<()> {
        for name in names {
            match self.ctl(&["stop", name]).await {
                Ok(out) if out.success && !reports_error(&out.stdout) => {}
                Ok(out) if already_stopped(&out.stdout) => {}
                Ok(out) => tracing::warn!(
                    program = %name,
                    output = %out.diagnostics(),
                    "stop failed; removing config anyway"
                ),
                Err(err) => tracing::warn!(
                    program = %name,
                    error = %err,
                    "stop failed; removing config anyway"
                ),
            }
            let path = self.conf_path(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("Failed to remove {}", path.display())));
                }
            }
        }
        self.reload().await
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.retry
            .run("supervisor reload", move || async move {
                self.ctl_ok(&["reread"]).await?;
                self.ctl_ok(&["update"]).await
            })
            .await
    }

    async fn status(&self, name: &str) -> anyhow::Result<ProgramState> {
        // Non-running programs make `status` exit non-zero; parse the text.
        let out = self.ctl(&["status", name]).await?;
        Ok(parse_status(&out.stdout, name))
    }
}

fn parse_status(stdout: &str, name: &str) -> ProgramState {
    stdout
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let program = fields.next()?;
            let short = program.rsplit(':').next().unwrap_or(program);
            if program != name && short != name {
                return None;
            }
            Some(match fields.next()? {
                "RUNNING" => ProgramState::Running,
                "STARTING" => ProgramState::Starting,
                "STOPPED" | "STOPPING" => ProgramState::Stopped,
                "FATAL" | "BACKOFF" | "EXITED" => ProgramState::Failed,
                _ => ProgramState::Unknown,
            })
        })
        .unwrap_or(ProgramState::Unknown)
}

/// Whether supervisorctl output carries one of its own error lines, such as
/// `ERROR: CANT_REREAD: ...` or `web: ERROR (spawn error)`.
fn reports_error(output: &str) -> bool {
    output.lines().map(str::trim).any(|line| {
        line.starts_with("ERROR") || line.contains(": ERROR (") || line.contains(": ERROR:")
    })
}

fn already_stopped(output: &str) -> bool {
    output.contains("ERROR (not running)") || output.contains("ERROR (no such process)")
}
