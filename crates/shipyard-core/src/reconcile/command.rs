//! Subprocess execution with timeouts.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stderr, falling back to stdout, trimmed for messages.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = text.trim();
        match text.char_indices().nth(2000) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.to_string(),
        }
    }
}

/// Run `argv` and capture its output. A non-zero exit is not an error here.
pub async fn run_argv(argv: &[String], limit: Duration) -> anyhow::Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    run(cmd, &argv.join(" "), limit).await
}

/// Run `script` through `sh -c` in `cwd` with extra environment.
pub async fn run_shell(
    script: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
    limit: Duration,
) -> anyhow::Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(cwd).envs(env);
    run(cmd, script, limit).await
}

async fn run(mut cmd: Command, label: &str, limit: Duration) -> anyhow::Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", label))?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("Failed to wait for '{}'", label))?,
        Err(_) => anyhow::bail!("'{}' timed out after {}s", label, limit.as_secs()),
    };

    let out = CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(command = %label, code = ?out.code, "command finished");
    Ok(out)
}
