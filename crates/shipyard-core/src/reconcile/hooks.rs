//! Pre/post deploy hook commands.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::command::run_shell;

#[derive(Debug, Clone)]
pub struct HookRunner {
    timeout: Duration,
}

impl HookRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `commands` in order inside `cwd`, stopping at the first failure.
    pub async fn run(
        &self,
        phase: &str,
        commands: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        for (index, command) in commands.iter().enumerate() {
            tracing::info!(phase, index, command = %command, "running hook");
            let out = run_shell(command, cwd, env, self.timeout).await?;
            if !out.stdout.trim().is_empty() {
                tracing::debug!(phase, index, stdout = %out.stdout.trim(), "hook output");
            }
            if !out.success {
                anyhow::bail!(
                    "{} hook #{} '{}' exited with {}: {}",
                    phase,
                    index + 1,
                    command,
                    out.code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    out.diagnostics()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn runs_in_order_with_env() {
        let tmp = TempDir::new().unwrap();
        let env = BTreeMap::from([("RELEASE_ID".to_string(), "r1".to_string())]);
        let hooks = vec![
            "echo first-$RELEASE_ID >> out.txt".to_string(),
            "echo second >> out.txt".to_string(),
        ];

        HookRunner::new(Duration::from_secs(5))
            .run("pre_deploy", &hooks, tmp.path(), &env)
            .await
            .unwrap();

        let out = std::fs::read_to_string(tmp.path().join("out.txt")).unwrap();
        assert_eq!(out, "first-r1\nsecond\n");
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let tmp = TempDir::new().unwrap();
        let hooks = vec![
            "echo migration failed >&2; exit 2".to_string(),
            "touch never".to_string(),
        ];

        let err = HookRunner::new(Duration::from_secs(5))
            .run("pre_deploy", &hooks, tmp.path(), &BTreeMap::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exited with 2: migration failed"));
        assert!(!tmp.path().join("never").exists());
    }
}
