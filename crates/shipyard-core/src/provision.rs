//! Runtime provisioner: one language runtime per (project, environment),
//! reused across releases and reinstalled only when its inputs change.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::{DeployError, Step};
use crate::fs::{hash_inputs, write_atomic};
use crate::manifest::Manifest;
use crate::reconcile::command::run_argv;

/// Interpreter version the runtime was created with.
const RUNTIME_MARKER: &str = ".shipyard-runtime";
/// Fingerprint of the last successfully installed dependency set.
const DEPS_MARKER: &str = ".shipyard-deps";

/// Builds runtimes and installs dependencies into them.
#[async_trait]
pub trait RuntimeInstaller: Send + Sync {
    async fn create(&self, runtime_dir: &Path, version: &str) -> anyhow::Result<()>;

    async fn install(&self, runtime_dir: &Path, requirements: &Path) -> anyhow::Result<()>;
}

/// `python -m venv` plus `pip install -r`.
#[derive(Debug, Clone)]
pub struct PythonVenvInstaller {
    fallback: String,
    timeout: Duration,
}

impl PythonVenvInstaller {
    pub fn new(fallback: String, timeout: Duration) -> Self {
        Self { fallback, timeout }
    }

    /// `python<version>` when installed, otherwise the configured interpreter.
    async fn interpreter(&self, version: &str) -> String {
        let versioned = format!("python{}", version);
        match run_argv(&[versioned.clone(), "--version".to_string()], self.timeout).await {
            Ok(out) if out.success => versioned,
            _ => {
                tracing::warn!(
                    requested = %versioned,
                    fallback = %self.fallback,
                    "requested interpreter not found"
                );
                self.fallback.clone()
            }
        }
    }
}

#[async_trait]
impl RuntimeInstaller for PythonVenvInstaller {
    async fn create(&self, runtime_dir: &Path, version: &str) -> anyhow::Result<()> {
        let python = self.interpreter(version).await;
        let argv = vec![
            python,
            "-m".to_string(),
            "venv".to_string(),
            runtime_dir.display().to_string(),
        ];
        let out = run_argv(&argv, self.timeout).await?;
        if !out.success {
            anyhow::bail!("venv creation failed: {}", out.diagnostics());
        }
        Ok(())
    }

    async fn install(&self, runtime_dir: &Path, requirements: &Path) -> anyhow::Result<()> {
        let pip = runtime_dir.join("bin").join("pip");
        let argv = vec![
            pip.display().to_string(),
            "install".to_string(),
            "--quiet".to_string(),
            "-r".to_string(),
            requirements.display().to_string(),
        ];
        let out = run_argv(&argv, self.timeout).await?;
        if !out.success {
            anyhow::bail!("pip install failed: {}", out.diagnostics());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub dir: PathBuf,
    pub version: String,
    pub fingerprint: String,
    /// Runtime created from scratch by this call.
    pub created: bool,
    /// Dependencies (re)installed by this call.
    pub installed: bool,
}

impl RuntimeHandle {
    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }
}

#[derive(Clone)]
pub struct RuntimeProvisioner {
    installer: Arc<dyn RuntimeInstaller>,
    apps_dir: PathBuf,
    default_version: String,
}

impl RuntimeProvisioner {
    pub fn new(installer: Arc<dyn RuntimeInstaller>, apps_dir: PathBuf, default_version: String) -> Self {
        Self {
            installer,
            apps_dir,
            default_version,
        }
    }

    /// `<apps>/<project>/envs/<environment>`
    pub fn runtime_dir(&self, project: &str, environment: &str) -> PathBuf {
        self.apps_dir.join(project).join("envs").join(environment)
    }

    pub async fn provision(
        &self,
        project: &str,
        environment: &str,
        working_dir: &Path,
        manifest: &Manifest,
        cancel: &CancelToken,
    ) -> Result<RuntimeHandle, DeployError> {
        cancel
            .run(Step::Provision, async {
                self.ensure(project, environment, working_dir, manifest)
                    .await
                    .map_err(|e| DeployError::Provision(format!("{:#}", e)))
            })
            .await
    }

    async fn ensure(
        &self,
        project: &str,
        environment: &str,
        working_dir: &Path,
        manifest: &Manifest,
    ) -> anyhow::Result<RuntimeHandle> {
        let dir = self.runtime_dir(project, environment);
        let version = manifest
            .python_version
            .clone()
            .unwrap_or_else(|| self.default_version.clone());

        let existing = read_marker(&dir.join(RUNTIME_MARKER))?;
        let created = existing.as_deref() != Some(version.as_str());
        if created {
            if existing.is_some() {
                tracing::info!(runtime = %dir.display(), version = %version, "interpreter changed, rebuilding runtime");
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to remove runtime: {}", dir.display()))?;
            }
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            self.installer.create(&dir, &version).await?;
            write_atomic(&dir.join(RUNTIME_MARKER), version.as_bytes())?;
        }

        let requirements = working_dir.join(&manifest.requirements);
        let requirements_bytes = match std::fs::read(&requirements) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("Failed to read {}", requirements.display())));
            }
        };
        let fingerprint = hash_inputs(&[
            ("python", Some(version.as_bytes())),
            ("requirements", requirements_bytes.as_deref()),
        ]);

        let previous = read_marker(&dir.join(DEPS_MARKER))?;
        let mut installed = false;
        if previous.as_deref() != Some(fingerprint.as_str()) {
            if requirements_bytes.is_some() {
                tracing::info!(requirements = %requirements.display(), "installing dependencies");
                self.installer.install(&dir, &requirements).await?;
                installed = true;
            } else {
                tracing::warn!(
                    requirements = %requirements.display(),
                    "requirements file not found, skipping dependency install"
                );
            }
            write_atomic(&dir.join(DEPS_MARKER), fingerprint.as_bytes())?;
        } else {
            tracing::debug!(runtime = %dir.display(), "dependencies unchanged");
        }

        Ok(RuntimeHandle {
            dir,
            version,
            fingerprint,
            created,
            installed,
        })
    }
}

fn read_marker(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow::Error::new(err).context(format!("Failed to read {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_install: bool,
    }

    #[async_trait]
    impl RuntimeInstaller for Recorder {
        async fn create(&self, dir: &Path, version: &str) -> anyhow::Result<()> {
            std::fs::create_dir_all(dir.join("bin"))?;
            self.calls.lock().unwrap().push(format!("create {}", version));
            Ok(())
        }

        async fn install(&self, _: &Path, requirements: &Path) -> anyhow::Result<()> {
            if self.fail_install {
                anyhow::bail!("no matching distribution for nosuchpkg");
            }
            let name = requirements.file_name().unwrap().to_string_lossy().to_string();
            self.calls.lock().unwrap().push(format!("install {}", name));
            Ok(())
        }
    }

    fn manifest() -> Manifest {
        Manifest::from_toml_str(
            "name = \"checkout\"\n[[services]]\nname = \"web\"\ncommand = \"run\"\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reuses_runtime_and_reinstalls_on_change() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("requirements.txt"), "django==4.2\n").unwrap();

        let recorder = Arc::new(Recorder::default());
        let provisioner =
            RuntimeProvisioner::new(recorder.clone(), tmp.path().join("apps"), "3.11".into());
        let cancel = CancelToken::new();

        let first = provisioner
            .provision("checkout", "qa", &src, &manifest(), &cancel)
            .await
            .unwrap();
        assert!(first.created && first.installed);

        let second = provisioner
            .provision("checkout", "qa", &src, &manifest(), &cancel)
            .await
            .unwrap();
        assert!(!second.created && !second.installed);
        assert_eq!(first.fingerprint, second.fingerprint);

        std::fs::write(src.join("requirements.txt"), "django==5.0\n").unwrap();
        let third = provisioner
            .provision("checkout", "qa", &src, &manifest(), &cancel)
            .await
            .unwrap();
        assert!(!third.created && third.installed);

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["create 3.11", "install requirements.txt", "install requirements.txt"]
        );
    }

    #[tokio::test]
    async fn install_failure_is_a_provision_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("requirements.txt"), "nosuchpkg\n").unwrap();
        let provisioner = RuntimeProvisioner::new(
            Arc::new(Recorder {
                fail_install: true,
                ..Default::default()
            }),
            tmp.path().join("apps"),
            "3.11".into(),
        );

        let err = provisioner
            .provision("checkout", "qa", tmp.path(), &manifest(), &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProvisionError");

        // A failed install leaves no fingerprint, so the next attempt retries.
        let deps = provisioner.runtime_dir("checkout", "qa").join(DEPS_MARKER);
        assert!(!deps.exists());
    }
}
