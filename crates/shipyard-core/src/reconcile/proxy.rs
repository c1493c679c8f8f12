//! Reverse proxy collaborator and its nginx implementation.

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use super::command::run_argv;
use super::retry::RetryPolicy;
use crate::fs::write_atomic;
use crate::render::ProxyConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The proxy refused the new configuration; the previous one is back in place.
    #[error("proxy rejected configuration: {0}")]
    Rejected(String),
    /// Nothing was changed.
    #[error("proxy unavailable: {0}")]
    Unavailable(String),
    /// The new configuration may be partially active.
    #[error("proxy left in an inconsistent state: {0}")]
    Partial(String),
}

#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Bytes of the installed site configuration, if any.
    async fn current(&self, site: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Install a site's upstream and routes, validate, and reload.
    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError>;

    /// Install raw site bytes (used to restore a known-good configuration).
    async fn restore(&self, site: &str, bytes: &[u8]) -> Result<(), ProxyError>;

    async fn remove(&self, site: &str) -> anyhow::Result<()>;

    async fn reload(&self) -> anyhow::Result<()>;
}

/// nginx with one `<site>.conf` per environment in an included directory.
#[derive(Debug, Clone)]
pub struct NginxProxy {
    conf_dir: PathBuf,
    test_command: Vec<String>,
    reload_command: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl NginxProxy {
    pub fn new(
        conf_dir: PathBuf,
        test_command: Vec<String>,
        reload_command: Vec<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            conf_dir,
            test_command,
            reload_command,
            retry,
            timeout,
        }
    }

    pub fn site_path(&self, site: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", site))
    }

    fn read(&self, site: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.site_path(site);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to read proxy config: {}", path.display()))),
        }
    }

    fn put_back(&self, site: &str, previous: Option<&[u8]>) -> anyhow::Result<()> {
        let path = self.site_path(site);
        match previous {
            Some(bytes) => write_atomic(&path, bytes),
            None => match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(anyhow::Error::new(err)
                    .context(format!("Failed to remove {}", path.display()))),
            },
        }
    }

    async fn test(&self) -> anyhow::Result<Result<(), String>> {
        let out = run_argv(&self.test_command, self.timeout).await?;
        Ok(if out.success {
            Ok(())
        } else {
            Err(out.diagnostics())
        })
    }

    /// Write `bytes`, test, reload; roll the file back if the test fails.
    async fn install(&self, site: &str, bytes: &[u8]) -> Result<(), ProxyError> {
        let previous = self
            .read(site)
            .map_err(|e| ProxyError::Unavailable(format!("{:#}", e)))?;
        if previous.as_deref() == Some(bytes) {
            tracing::debug!(site, "proxy config unchanged");
            return Ok(());
        }

        std::fs::create_dir_all(&self.conf_dir)
            .map_err(|e| ProxyError::Unavailable(e.to_string()))?;
        write_atomic(&self.site_path(site), bytes)
            .map_err(|e| ProxyError::Unavailable(format!("{:#}", e)))?;

        let verdict = self.test().await;
        let rejection = match verdict {
            Ok(Ok(())) => None,
            Ok(Err(diagnostics)) => Some(diagnostics),
            Err(err) => Some(format!("{:#}", err)),
        };
        if let Some(reason) = rejection {
            return match self.put_back(site, previous.as_deref()) {
                Ok(()) => Err(ProxyError::Rejected(reason)),
                Err(err) => Err(ProxyError::Partial(format!(
                    "{}; restoring previous config failed: {:#}",
                    reason, err
                ))),
            };
        }

        self.reload()
            .await
            .map_err(|e| ProxyError::Partial(format!("config written but reload failed: {:#}", e)))
    }
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn current(&self, site: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.read(site)
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        self.install(&config.site, config.to_nginx().as_bytes()).await
    }

    async fn restore(&self, site: &str, bytes: &[u8]) -> Result<(), ProxyError> {
        self.install(site, bytes).await
    }

    async fn remove(&self, site: &str) -> anyhow::Result<()> {
        let existed = self.read(site)?.is_some();
        self.put_back(site, None)?;
        if existed {
            self.reload().await?;
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        self.retry
            .run("proxy reload", move || async move {
                let out = run_argv(&self.reload_command, self.timeout).await?;
                if !out.success {
                    anyhow::bail!("{}", out.diagnostics());
                }
                Ok(())
            })
            .await
            .context("Failed to reload proxy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ProxyConfig;
    use tempfile::TempDir;

    fn site(ports: Vec<u16>) -> ProxyConfig {
        ProxyConfig {
            site: "checkout-qa".into(),
            upstream: "checkout_qa".into(),
            server_name: "_".into(),
            ports,
            tls: None,
            aliases: Vec::new(),
            health_path: None,
        }
    }

    fn proxy(tmp: &TempDir, test: &str) -> NginxProxy {
        NginxProxy::new(
            tmp.path().join("sites"),
            vec!["sh".into(), "-c".into(), test.into()],
            vec!["true".into()],
            RetryPolicy::none(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn applies_valid_config() {
        let tmp = TempDir::new().unwrap();
        let nginx = proxy(&tmp, "exit 0");

        nginx.apply(&site(vec![8100])).await.unwrap();

        let bytes = nginx.current("checkout-qa").await.unwrap().unwrap();
        assert!(String::from_utf8(bytes).unwrap().contains("127.0.0.1:8100"));
    }

    #[tokio::test]
    async fn rejected_config_restores_previous_bytes() {
        let tmp = TempDir::new().unwrap();
        proxy(&tmp, "exit 0").apply(&site(vec![8100])).await.unwrap();
        let nginx = proxy(&tmp, "echo 'emerg: bad upstream' >&2; exit 1");
        let before = nginx.current("checkout-qa").await.unwrap();

        let err = nginx.apply(&site(vec![8110])).await.unwrap_err();

        assert!(matches!(err, ProxyError::Rejected(ref msg) if msg.contains("bad upstream")));
        assert_eq!(nginx.current("checkout-qa").await.unwrap(), before);
    }

    #[tokio::test]
    async fn rejected_first_config_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let nginx = proxy(&tmp, "exit 1");

        assert!(nginx.apply(&site(vec![8100])).await.is_err());
        assert!(nginx.current("checkout-qa").await.unwrap().is_none());
    }
}
