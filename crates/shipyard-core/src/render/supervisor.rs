//! Supervisor program definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::manifest::{Resources, ServiceKind};

/// One supervised process of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDefinition {
    /// Supervisor program name, unique per release.
    pub name: String,
    pub service: String,
    pub kind: ServiceKind,
    pub command: String,
    pub directory: PathBuf,
    pub user: String,
    pub environment: BTreeMap<String, String>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub port: Option<u16>,
    pub resources: Option<Resources>,
}

impl ProgramDefinition {
    /// Supervisor `[program:x]` section.
    pub fn to_conf(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; managed by shipyard, do not edit");
        let _ = writeln!(out, "; service={} type={}", self.service, self.kind.as_str());
        if let Some(resources) = &self.resources {
            let _ = writeln!(out, "; {}", describe_resources(resources));
        }
        let _ = writeln!(out, "[program:{}]", self.name);
        let _ = writeln!(out, "command={}", escape_percent(&self.command));
        let _ = writeln!(out, "directory={}", self.directory.display());
        let _ = writeln!(out, "user={}", self.user);
        let _ = writeln!(out, "autostart=true");
        let _ = writeln!(out, "autorestart=true");
        let _ = writeln!(out, "startsecs=10");
        let _ = writeln!(out, "stopwaitsecs=30");
        let _ = writeln!(out, "killasgroup=true");
        let _ = writeln!(out, "stopasgroup=true");
        let _ = writeln!(out, "stdout_logfile={}", self.stdout_log.display());
        let _ = writeln!(out, "stdout_logfile_maxbytes=10MB");
        let _ = writeln!(out, "stdout_logfile_backups=5");
        let _ = writeln!(out, "stderr_logfile={}", self.stderr_log.display());
        let _ = writeln!(out, "stderr_logfile_maxbytes=10MB");
        let _ = writeln!(out, "stderr_logfile_backups=5");
        if !self.environment.is_empty() {
            let pairs: Vec<String> = self
                .environment
                .iter()
                .map(|(key, value)| format!("{}=\"{}\"", key, escape_env_value(value)))
                .collect();
            let _ = writeln!(out, "environment={}", pairs.join(","));
        }
        out
    }
}

/// Supervisor has no native resource limits; declared limits are kept as
/// annotations and exported to the process as `SHIPYARD_MAX_*` variables.
fn describe_resources(resources: &Resources) -> String {
    let mut parts = Vec::new();
    if let Some(mem) = resources.max_memory {
        parts.push(format!("max_memory={}MB", mem));
    }
    if let Some(cpu) = resources.max_cpu {
        parts.push(format!("max_cpu={}", cpu));
    }
    format!("resources: {}", parts.join(" "))
}

pub(crate) fn resource_env(resources: &Resources) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    if let Some(mem) = resources.max_memory {
        vars.push(("SHIPYARD_MAX_MEMORY_MB".to_string(), mem.to_string()));
    }
    if let Some(cpu) = resources.max_cpu {
        vars.push(("SHIPYARD_MAX_CPU".to_string(), cpu.to_string()));
    }
    vars
}

/// Supervisor expands `%(name)s` in values.
fn escape_percent(value: &str) -> String {
    value.replace('%', "%%")
}

fn escape_env_value(value: &str) -> String {
    escape_percent(&value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Supervisor program name for a service of a release.
pub fn program_name(project: &str, environment: &str, service: &str, release_id: &str) -> String {
    format!("{}-{}-{}-{}", project, environment, service, release_id).replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> ProgramDefinition {
        ProgramDefinition {
            name: "checkout-qa-web-20260101-120000-abc1234".into(),
            service: "web".into(),
            kind: ServiceKind::Web,
            command: "/srv/envs/qa/bin/gunicorn app.wsgi --bind 127.0.0.1:8100".into(),
            directory: PathBuf::from("/srv/apps/checkout/releases/qa/r1/src"),
            user: "deploy".into(),
            environment: BTreeMap::from([
                ("PORT".to_string(), "8100".to_string()),
                ("GREETING".to_string(), "say \"hi\" 100%".to_string()),
            ]),
            stdout_log: PathBuf::from("/srv/apps/checkout/logs/qa/web_stdout.log"),
            stderr_log: PathBuf::from("/srv/apps/checkout/logs/qa/web_stderr.log"),
            port: Some(8100),
            resources: Some(Resources {
                max_memory: Some(512),
                max_cpu: Some(0.5),
            }),
        }
    }

    #[test]
    fn renders_program_section() {
        let conf = program().to_conf();
        assert!(conf.contains("[program:checkout-qa-web-20260101-120000-abc1234]\n"));
        assert!(conf.contains("startsecs=10\n"));
        assert!(conf.contains("stopasgroup=true\n"));
        assert!(conf.contains("; resources: max_memory=512MB max_cpu=0.5\n"));
        assert!(conf.contains(r#"environment=GREETING="say \"hi\" 100%%",PORT="8100""#));
    }

    #[test]
    fn program_names_replace_underscores() {
        assert_eq!(
            program_name("checkout", "qa", "celery_worker", "20260101-120000-abc1234"),
            "checkout-qa-celery-worker-20260101-120000-abc1234"
        );
    }
}
