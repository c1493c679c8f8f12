#![allow(dead_code)]

pub mod git;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use shipyard_core::fetch::{FetchedTree, VersionControl};
use shipyard_core::fs::LinkMode;
use shipyard_core::health::{HealthPolicy, HealthProbe};
use shipyard_core::ledger::RevisionInfo;
use shipyard_core::orchestration::{Collaborators, Orchestrator, OrchestratorSettings};
use shipyard_core::provision::RuntimeInstaller;
use shipyard_core::reconcile::{ProcessSupervisor, ProgramState, ProxyError, ReverseProxy};
use shipyard_core::registry::ProjectRequest;
use shipyard_core::render::{ProgramDefinition, ProxyConfig, SecretStore};

pub const WEB_MANIFEST: &str = r#"
name = "checkout"

[[services]]
name = "web"
type = "web"
command = "gunicorn app.wsgi --bind 127.0.0.1:${PORT}"

[services.health_check]
endpoint = "/health/"
interval = 1

[[services]]
name = "worker"
type = "worker"
command = "celery -A app worker"
"#;

/// Serves revisions from trees written on demand. Unknown revisions fail.
pub struct FakeVcs {
    root: PathBuf,
    revisions: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl FakeVcs {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            revisions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Publish `files` as `revision`.
    pub fn publish(&self, revision: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        self.revisions
            .lock()
            .unwrap()
            .insert(revision.to_string(), files);
    }
}

impl VersionControl for FakeVcs {
    fn fetch(
        &self,
        _remote: &str,
        revision: Option<&str>,
        default_branch: &str,
    ) -> anyhow::Result<FetchedTree> {
        let reference = revision.unwrap_or(default_branch);
        let files = self
            .revisions
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown revision '{}'", reference))?;

        let commit = format!("{:0<40}", reference);
        let tree = self.root.join(&commit);
        if !tree.exists() {
            for (path, content) in &files {
                let path = tree.join(path);
                std::fs::create_dir_all(path.parent().unwrap())?;
                std::fs::write(path, content)?;
            }
        }
        Ok(FetchedTree {
            tree,
            revision: RevisionInfo {
                requested: revision.map(str::to_string),
                commit,
                message: format!("release {}", reference),
                author: "Dev <dev@example.com>".to_string(),
                committed_at: None,
            },
        })
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    pub installs: Mutex<usize>,
}

#[async_trait]
impl RuntimeInstaller for FakeInstaller {
    async fn create(&self, runtime_dir: &Path, _version: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(runtime_dir.join("bin"))?;
        Ok(())
    }

    async fn install(&self, _runtime_dir: &Path, _requirements: &Path) -> anyhow::Result<()> {
        *self.installs.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct NoSecrets;

impl SecretStore for NoSecrets {
    fn resolve(&self, _: &str, _: &str, _: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Supervisor keeping its programs in memory; every known program runs.
#[derive(Default)]
pub struct MemorySupervisor {
    programs: Mutex<BTreeMap<String, ProgramDefinition>>,
    removed: Mutex<Vec<String>>,
}

impl MemorySupervisor {
    pub fn running(&self) -> BTreeSet<String> {
        self.programs.lock().unwrap().keys().cloned().collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn program(&self, name: &str) -> Option<ProgramDefinition> {
        self.programs.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ProcessSupervisor for MemorySupervisor {
    async fn apply(&self, programs: &[ProgramDefinition]) -> anyhow::Result<()> {
        let mut known = self.programs.lock().unwrap();
        for program in programs {
            known.insert(program.name.clone(), program.clone());
        }
        Ok(())
    }

    async fn remove(&self, names: &[String]) -> anyhow::Result<()> {
        let mut known = self.programs.lock().unwrap();
        for name in names {
            if known.remove(name).is_some() {
                self.removed.lock().unwrap().push(name.clone());
            }
        }
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn status(&self, name: &str) -> anyhow::Result<ProgramState> {
        Ok(if self.programs.lock().unwrap().contains_key(name) {
            ProgramState::Running
        } else {
            ProgramState::Stopped
        })
    }
}

/// Proxy storing rendered site files in memory.
#[derive(Default)]
pub struct MemoryProxy {
    sites: Mutex<BTreeMap<String, Vec<u8>>>,
    reject: Mutex<bool>,
}

impl MemoryProxy {
    pub fn site(&self, site: &str) -> Option<String> {
        self.sites
            .lock()
            .unwrap()
            .get(site)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn set_site(&self, site: &str, content: &str) {
        self.sites
            .lock()
            .unwrap()
            .insert(site.to_string(), content.as_bytes().to_vec());
    }

    /// Make the next configuration test fail.
    pub fn reject_next(&self) {
        *self.reject.lock().unwrap() = true;
    }
}

#[async_trait]
impl ReverseProxy for MemoryProxy {
    async fn current(&self, site: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.sites.lock().unwrap().get(site).cloned())
    }

    async fn apply(&self, config: &ProxyConfig) -> Result<(), ProxyError> {
        if std::mem::take(&mut *self.reject.lock().unwrap()) {
            return Err(ProxyError::Rejected(format!(
                "nginx: [emerg] invalid upstream in {}.conf",
                config.site
            )));
        }
        self.sites
            .lock()
            .unwrap()
            .insert(config.site.clone(), config.to_nginx().into_bytes());
        Ok(())
    }

    async fn restore(&self, site: &str, bytes: &[u8]) -> Result<(), ProxyError> {
        self.sites
            .lock()
            .unwrap()
            .insert(site.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, site: &str) -> anyhow::Result<()> {
        self.sites.lock().unwrap().remove(site);
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Answers 200 unless a port has been given another status.
#[derive(Default)]
pub struct PortProbe {
    codes: Mutex<BTreeMap<u16, u16>>,
}

impl PortProbe {
    pub fn respond(&self, port: u16, code: u16) {
        self.codes.lock().unwrap().insert(port, code);
    }
}

#[async_trait]
impl HealthProbe for PortProbe {
    async fn probe(&self, port: u16, _path: &str) -> anyhow::Result<u16> {
        Ok(self.codes.lock().unwrap().get(&port).copied().unwrap_or(200))
    }
}

/// An orchestrator over in-memory collaborators, with `checkout` registered
/// at port 8100 with `qa` (slot 0) and `prod` (slot 1).
pub struct Harness {
    pub tmp: TempDir,
    pub vcs: Arc<FakeVcs>,
    pub installer: Arc<FakeInstaller>,
    pub supervisor: Arc<MemorySupervisor>,
    pub proxy: Arc<MemoryProxy>,
    pub probe: Arc<PortProbe>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings(tmp.path());
        adjust(&mut settings);
        let vcs = Arc::new(FakeVcs::new(tmp.path().join("trees")));
        let installer = Arc::new(FakeInstaller::default());
        let supervisor = Arc::new(MemorySupervisor::default());
        let proxy = Arc::new(MemoryProxy::default());
        let probe = Arc::new(PortProbe::default());

        let orchestrator = Orchestrator::new(
            settings,
            Collaborators {
                vcs: vcs.clone(),
                installer: installer.clone(),
                secrets: Arc::new(NoSecrets),
                supervisor: supervisor.clone(),
                proxy: proxy.clone(),
                probe: probe.clone(),
            },
        );
        orchestrator
            .registry()
            .register_project(
                ProjectRequest::new("checkout", "https://git.example.com/checkout.git", 8100)
                    .with_environments(["qa", "prod"]),
            )
            .unwrap();

        vcs.publish(
            "abc123",
            &[
                ("deploy.toml", WEB_MANIFEST),
                ("requirements.txt", "django==5.0\n"),
                ("app/wsgi.py", "application = None\n"),
            ],
        );
        vcs.publish(
            "def456",
            &[
                ("deploy.toml", WEB_MANIFEST),
                ("requirements.txt", "django==5.0\n"),
                ("app/wsgi.py", "application = object()\n"),
            ],
        );

        Self {
            tmp,
            vcs,
            installer,
            supervisor,
            proxy,
            probe,
            orchestrator,
        }
    }

    pub fn site(&self, environment: &str) -> Option<String> {
        self.proxy.site(&format!("checkout-{}", environment))
    }

    /// Publish `revision` with the standard app and extra manifest text.
    pub fn publish_with(&self, revision: &str, manifest_extra: &str) {
        let manifest = format!("{}\n{}", WEB_MANIFEST, manifest_extra);
        self.vcs.publish(
            revision,
            &[
                ("deploy.toml", manifest.as_str()),
                ("requirements.txt", "django==5.0\n"),
                ("app/wsgi.py", "application = None\n"),
            ],
        );
    }
}

pub fn settings(root: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        state_dir: root.join("state"),
        apps_dir: root.join("apps"),
        link_mode: LinkMode::Copy,
        deploy_user: "deploy".to_string(),
        default_python_version: "3.11".to_string(),
        grace_period: Duration::ZERO,
        hook_timeout: Duration::from_secs(30),
        stale_after: Duration::from_secs(600),
        keep_releases: 5,
        health: HealthPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
            failure_threshold: Some(1),
        },
    }
}
