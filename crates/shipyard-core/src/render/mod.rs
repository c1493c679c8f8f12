//! Config renderer: manifest + bindings -> supervisor programs and proxy site.
//!
//! [`render`] is pure. Secrets are looked up beforehand by
//! [`resolve_bindings`], so a render failure never depends on when it runs and
//! always happens before any external system is touched.

pub mod proxy;
pub mod secrets;
pub mod supervisor;
pub mod template;

pub use proxy::{PathAlias, ProxyConfig, TlsFiles, site_name};
pub use secrets::{FileSecretStore, SecretStore};
pub use supervisor::{ProgramDefinition, program_name};
pub use template::{TemplateError, substitute};

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::DeployError;
use crate::manifest::{EnvValue, Manifest, ServiceKind};
use crate::registry::{Color, EnvironmentEntry, PortPlan, Project};

/// Interpreters and entry points resolved from the runtime's `bin` directory.
const RUNTIME_EXECUTABLES: [&str; 9] = [
    "python",
    "python3",
    "pip",
    "gunicorn",
    "uvicorn",
    "daphne",
    "celery",
    "django-admin",
    "uwsgi",
];

const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything a render needs besides secrets.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub project: &'a Project,
    pub environment: &'a str,
    pub env_entry: &'a EnvironmentEntry,
    pub release_id: &'a str,
    pub release_path: &'a Path,
    /// `<release>/src` when present, else the release root.
    pub working_dir: &'a Path,
    pub runtime_dir: &'a Path,
    pub manifest: &'a Manifest,
    pub ports: &'a BTreeMap<String, u16>,
    pub user: &'a str,
    pub log_dir: &'a Path,
    pub media_dir: &'a Path,
}

/// Secret values referenced by a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    pub secrets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SupervisorConfig {
    pub programs: Vec<ProgramDefinition>,
}

impl SupervisorConfig {
    pub fn program_names(&self) -> Vec<String> {
        self.programs.iter().map(|p| p.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedRelease {
    pub supervisor: SupervisorConfig,
    /// `None` when the release has no web service.
    pub proxy: Option<ProxyConfig>,
    /// Environment for hooks: everything a program sees except `PORT`.
    pub hook_env: BTreeMap<String, String>,
}

/// Look up every secret the manifest references.
pub fn resolve_bindings(
    manifest: &Manifest,
    project: &str,
    environment: &str,
    store: &dyn SecretStore,
) -> Result<Bindings, DeployError> {
    let mut keys: Vec<String> = Vec::new();
    for value in manifest.env_vars.values() {
        match value {
            EnvValue::Secret { secret } => keys.push(secret.clone()),
            EnvValue::Text(text) => keys.extend(secret_references(text)),
            _ => {}
        }
    }
    keys.sort();
    keys.dedup();

    let mut bindings = Bindings::default();
    for key in keys {
        let value = store
            .resolve(project, environment, &key)
            .map_err(|e| DeployError::Render(format!("secret store: {:#}", e)))?
            .ok_or_else(|| {
                DeployError::Render(format!(
                    "secret '{}' is not set for {}/{}",
                    key, project, environment
                ))
            })?;
        bindings.secrets.insert(key, value);
    }
    Ok(bindings)
}

/// `${SECRET_NAME}` references inside a literal.
fn secret_references(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find("${SECRET_") {
        let after = &rest[idx + "${SECRET_".len()..];
        match after.find('}') {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Assign ports to the enabled services that need one, in declaration order.
pub fn assign_ports(
    manifest: &Manifest,
    plan: &PortPlan,
    color: Color,
) -> anyhow::Result<BTreeMap<String, u16>> {
    let mut ports = BTreeMap::new();
    for (index, service) in manifest
        .enabled_services()
        .filter(|s| s.needs_port())
        .enumerate()
    {
        ports.insert(service.name.clone(), plan.port(color, index)?);
    }
    Ok(ports)
}

pub fn render(ctx: &RenderContext<'_>, bindings: &Bindings) -> Result<RenderedRelease, DeployError> {
    let runtime_bin = ctx.runtime_dir.join("bin");
    let queue_name = format!("{}-{}", ctx.project.name, ctx.environment);

    let mut env: BTreeMap<String, String> = BTreeMap::new();
    let mut builtin = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };
    builtin("PROJECT_NAME", ctx.project.name.clone());
    builtin("ENVIRONMENT", ctx.environment.to_string());
    builtin("DEPLOYMENT_ENV", ctx.environment.to_string());
    builtin("QUEUE_NAME", queue_name);
    builtin("RELEASE_ID", ctx.release_id.to_string());
    builtin("DEPLOYMENT_VERSION", ctx.release_id.to_string());
    builtin("RELEASE_PATH", ctx.release_path.display().to_string());
    builtin("RUNTIME_BIN", runtime_bin.display().to_string());
    builtin("VIRTUAL_ENV", ctx.runtime_dir.display().to_string());
    builtin("PATH", format!("{}:{}", runtime_bin.display(), SYSTEM_PATH));

    let mut template_vars = env.clone();
    for (key, value) in &bindings.secrets {
        template_vars.insert(format!("SECRET_{}", key), value.clone());
    }

    for (key, value) in &ctx.manifest.env_vars {
        let resolved = match value {
            EnvValue::Secret { secret } => bindings.secrets.get(secret).cloned().ok_or_else(|| {
                DeployError::Render(format!("env var {}: secret '{}' not resolved", key, secret))
            })?,
            EnvValue::Text(text) => substitute(text, &template_vars)
                .map_err(|e| DeployError::Render(format!("env var {}: {}", key, e)))?,
            other => other.literal().unwrap_or_default(),
        };
        env.insert(key.clone(), resolved);
    }

    let mut programs = Vec::new();
    for service in ctx.manifest.enabled_services() {
        let port = ctx.ports.get(&service.name).copied();
        if service.needs_port() && port.is_none() {
            return Err(DeployError::Render(format!(
                "service '{}' has no port assigned",
                service.name
            )));
        }

        let mut program_env = env.clone();
        if let Some(port) = port {
            program_env.insert("PORT".to_string(), port.to_string());
        }
        if let Some(resources) = &service.resources {
            program_env.extend(supervisor::resource_env(resources));
        }

        let command = substitute(&service.command, &program_env)
            .map_err(|e| DeployError::Render(format!("service '{}': {}", service.name, e)))?;
        let command = resolve_executable(&command, &runtime_bin);

        programs.push(ProgramDefinition {
            name: program_name(
                &ctx.project.name,
                ctx.environment,
                &service.name,
                ctx.release_id,
            ),
            service: service.name.clone(),
            kind: service.kind,
            command,
            directory: ctx.working_dir.to_path_buf(),
            user: ctx.user.to_string(),
            environment: program_env,
            stdout_log: ctx.log_dir.join(format!("{}_stdout.log", service.name)),
            stderr_log: ctx.log_dir.join(format!("{}_stderr.log", service.name)),
            port,
            resources: service.resources.clone(),
        });
    }

    let proxy = render_proxy(ctx, &programs);
    Ok(RenderedRelease {
        supervisor: SupervisorConfig { programs },
        proxy,
        hook_env: env,
    })
}

fn render_proxy(ctx: &RenderContext<'_>, programs: &[ProgramDefinition]) -> Option<ProxyConfig> {
    let ports: Vec<u16> = programs
        .iter()
        .filter(|p| p.kind == ServiceKind::Web)
        .filter_map(|p| p.port)
        .collect();
    if ports.is_empty() {
        return None;
    }

    let site = site_name(&ctx.project.name, ctx.environment);
    let mut aliases: Vec<PathAlias> = ctx
        .manifest
        .static_aliases
        .iter()
        .map(|alias| PathAlias {
            url: alias.url.clone(),
            dir: ctx.working_dir.join(alias.dir.trim_end_matches('/')),
            expires: "30d".to_string(),
            immutable: true,
        })
        .collect();
    aliases.push(PathAlias {
        url: "/media/".to_string(),
        dir: ctx.media_dir.to_path_buf(),
        expires: "7d".to_string(),
        immutable: false,
    });

    let health_path = ctx
        .manifest
        .enabled_services()
        .filter(|s| s.kind == ServiceKind::Web)
        .find_map(|s| s.health_check.as_ref())
        .map(|check| check.endpoint.clone());

    Some(ProxyConfig {
        upstream: site.replace('-', "_"),
        server_name: ctx
            .env_entry
            .domain
            .clone()
            .unwrap_or_else(|| "_".to_string()),
        ports,
        tls: ctx.env_entry.ssl.then(|| TlsFiles::for_site(&site)),
        aliases,
        health_path,
        site,
    })
}

/// Point a leading runtime executable at the runtime's `bin` directory.
///
/// Supervisor resolves relative commands against its own `PATH`, not the
/// program's environment.
fn resolve_executable(command: &str, runtime_bin: &Path) -> String {
    let trimmed = command.trim_start();
    let (first, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, Some(rest)),
        None => (trimmed, None),
    };
    if !RUNTIME_EXECUTABLES.contains(&first) {
        return command.to_string();
    }
    let exe = runtime_bin.join(first).display().to_string();
    match rest {
        Some(rest) => format!("{} {}", exe, rest.trim_start()),
        None => exe,
    }
}
