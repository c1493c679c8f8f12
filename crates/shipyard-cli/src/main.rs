//! Shipyard - self-hosted release orchestrator
//!
//! Usage:
//!   shipyard register-project checkout git@host:checkout.git --port-start 8100 --env qa
//!   shipyard deploy checkout qa --revision abc123
//!   shipyard rollback checkout qa
//!   shipyard status checkout qa
//!   shipyard list --env qa
//!   shipyard reset-deployments checkout --force

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipyard_core::orchestration::deploy::default_initiator;
use shipyard_core::prelude::*;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Self-hosted release orchestrator", long_about = None)]
struct Cli {
    /// Path to shipyard.toml (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project and its port range
    RegisterProject {
        name: String,
        /// Git remote URL
        repository: String,
        /// First port of the project's 160-port range
        #[arg(long)]
        port_start: u16,
        /// Default branch deployed when no revision is given
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        description: Option<String>,
        /// Environments to register with the project
        #[arg(long = "env", value_name = "ENV")]
        environments: Vec<String>,
    },

    /// Register an environment of an existing project
    RegisterEnv {
        project: String,
        environment: String,
        /// Public server name for the proxy site
        #[arg(long)]
        domain: Option<String>,
        /// Serve the site over TLS
        #[arg(long)]
        ssl: bool,
    },

    /// Remove a project from the registry
    #[command(alias = "rm")]
    Deregister {
        project: String,
        /// Tear down live releases instead of refusing
        #[arg(long)]
        force: bool,
    },

    /// Delete the deployment records of a project (releases are kept)
    ResetDeployments {
        project: String,
        /// Required whenever there is something to delete
        #[arg(long)]
        force: bool,
    },

    /// Deploy a revision to an environment
    Deploy {
        project: String,
        environment: String,
        /// Branch, tag or commit (default branch when omitted)
        #[arg(long, short)]
        revision: Option<String>,
        /// Recorded as deployed_by (defaults to $USER)
        #[arg(long)]
        initiator: Option<String>,
        /// Give up and abort after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Re-promote the previous live release
    Rollback {
        project: String,
        environment: String,
        #[arg(long)]
        initiator: Option<String>,
    },

    /// Reclaim a stale lock and close out an abandoned deployment
    Cleanup { project: String, environment: String },

    /// List deployment records, newest first
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long = "env")]
        environment: Option<String>,
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Show the live release of an environment
    Status { project: String, environment: String },

    /// Show the releases of an environment, newest first
    History {
        project: String,
        environment: String,
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
    /// Print nothing; the exit code tells the outcome
    Quiet,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipyard=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::load(cli.config.clone())?;
    tracing::debug!(
        config = %ctx.config_path().display(),
        state = %ctx.state_dir().display(),
        "configuration loaded"
    );
    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(run_cli(&ctx, cli.command, cli.format))?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_cli(ctx: &AppContext, command: Commands, format: OutputFormat) -> Result<i32> {
    let orchestrator = ctx.orchestrator()?;
    match command {
        Commands::RegisterProject {
            name,
            repository,
            port_start,
            branch,
            description,
            environments,
        } => {
            let mut request = ProjectRequest::new(name, repository, port_start)
                .with_branch(branch)
                .with_environments(environments);
            if let Some(description) = description {
                request = request.with_description(description);
            }
            let project = orchestrator.register_project(request).await?;
            match format {
                OutputFormat::Json => print_json(&project)?,
                OutputFormat::Table => print_project(&project),
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
        Commands::RegisterEnv {
            project,
            environment,
            domain,
            ssl,
        } => {
            let entry = orchestrator
                .register_environment(&project, &environment, domain, ssl)
                .await?;
            match format {
                OutputFormat::Json => print_json(&entry)?,
                OutputFormat::Table => println!(
                    "Registered {}/{} (slot {}{})",
                    project,
                    environment,
                    entry.slot,
                    entry
                        .domain
                        .as_deref()
                        .map(|d| format!(", {}", d))
                        .unwrap_or_default()
                ),
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
        Commands::Deregister { project, force } => {
            let removed = orchestrator.deregister_project(&project, force).await?;
            if matches!(format, OutputFormat::Table) {
                println!("Deregistered {}", removed.name);
            }
            Ok(0)
        }
        Commands::ResetDeployments { project, force } => {
            let removed = orchestrator.reset_deployments(&project, force)?;
            match format {
                OutputFormat::Json => {
                    print_json(&serde_json::json!({ "project": project, "removed": removed }))?
                }
                OutputFormat::Table if removed == 0 => {
                    println!("No deployment records for {}", project)
                }
                OutputFormat::Table => {
                    println!("Deleted {} deployment records for {}", removed, project)
                }
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
        Commands::Deploy {
            project,
            environment,
            revision,
            initiator,
            timeout,
        } => {
            let mut request = DeployRequest::new(project, environment)
                .with_initiator(initiator.unwrap_or_else(default_initiator));
            if let Some(revision) = revision {
                request = request.with_revision(revision);
            }
            let cancel = cancel_on_interrupt();
            if let Some(secs) = timeout {
                cancel.cancel_after(Duration::from_secs(secs));
            }
            let outcome = orchestrator.deploy(request, &cancel).await;
            report_outcome(outcome, format)
        }
        Commands::Rollback {
            project,
            environment,
            initiator,
        } => {
            let initiator = initiator.unwrap_or_else(default_initiator);
            let cancel = cancel_on_interrupt();
            let outcome = orchestrator
                .rollback(&project, &environment, &initiator, &cancel)
                .await;
            report_outcome(outcome, format)
        }
        Commands::Cleanup {
            project,
            environment,
        } => {
            let report = orchestrator.cleanup(&project, &environment).await?;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => print_cleanup(&report),
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
        Commands::List {
            project,
            environment,
            limit,
        } => {
            let records =
                orchestrator.list_deployments(project.as_deref(), environment.as_deref(), limit)?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Table => print_records(&records),
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
        Commands::Status {
            project,
            environment,
        } => {
            let status = orchestrator.status(&project, &environment).await?;
            match format {
                OutputFormat::Json => print_json(&status)?,
                OutputFormat::Table => print_status(&status),
                OutputFormat::Quiet => {}
            }
            Ok(if status.current.is_some() { 0 } else { 1 })
        }
        Commands::History {
            project,
            environment,
            limit,
        } => {
            let releases = orchestrator.history(&project, &environment, limit)?;
            match format {
                OutputFormat::Json => print_json(&releases)?,
                OutputFormat::Table => print_releases(&releases),
                OutputFormat::Quiet => {}
            }
            Ok(0)
        }
    }
}

/// Token cancelled by the first Ctrl-C.
fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; aborting...");
            handle.cancel();
        }
    });
    cancel
}

/// Print a deploy/rollback outcome and map it to an exit code.
fn report_outcome(outcome: DeployResult, format: OutputFormat) -> Result<i32> {
    match outcome {
        Ok(record) => {
            match format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Table => print_record(&record),
                OutputFormat::Quiet => {}
            }
            Ok(if record.is_live() { 0 } else { 1 })
        }
        Err(err) => {
            if let OutputFormat::Json = format {
                print_json(&serde_json::json!({
                    "status": "error",
                    "reason": err.kind(),
                    "message": err.to_string(),
                }))?;
            } else {
                eprintln!("error[{}]: {}", err.kind(), err);
            }
            Ok(2)
        }
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let output = serde_json::json!({
        "schema_version": 1,
        "data": value,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_project(project: &Project) {
    println!("Registered project {}", project.name);
    println!("  Repository: {}", project.repository);
    println!("  Branch:     {}", project.default_branch);
    println!(
        "  Ports:      {}-{}",
        project.port_start,
        u32::from(project.port_start) + 159
    );
    for (name, entry) in &project.environments {
        println!("  Env:        {} (slot {})", name, entry.slot);
    }
}

fn print_record(record: &DeploymentRecord) {
    let verdict = if record.is_live() { "LIVE" } else { "FAILED" };
    println!(
        "{} {} {}/{} -> {}",
        verdict,
        record.kind.as_str(),
        record.project,
        record.environment,
        record.release_id.as_deref().unwrap_or("-")
    );
    if let Some(reason) = &record.reason {
        println!(
            "  Reason: {}{}",
            reason,
            record
                .message
                .as_deref()
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        );
    }
    for step in &record.steps {
        println!(
            "  {:<8} {:<18} {}",
            step_symbol(step.status),
            step.step.as_str(),
            step.message.as_deref().unwrap_or("")
        );
    }
}

fn print_records(records: &[DeploymentRecord]) {
    if records.is_empty() {
        println!("No deployments recorded.");
        return;
    }
    println!(
        "{:<20} {:<16} {:<10} {:<8} {:<28} Reason",
        "Finished", "Project/Env", "Kind", "Status", "Release"
    );
    println!("{}", "-".repeat(100));
    for record in records {
        println!(
            "{:<20} {:<16} {:<10} {:<8} {:<28} {}",
            record.finished_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(&format!("{}/{}", record.project, record.environment), 16),
            record.kind.as_str(),
            record.status.as_str(),
            truncate(record.release_id.as_deref().unwrap_or("-"), 28),
            record.reason.as_deref().unwrap_or("")
        );
    }
}

fn print_status(status: &EnvironmentStatus) {
    println!("{}/{}", status.project, status.environment);
    match &status.current {
        Some(release) => {
            println!("  Live:     {} ({})", release.id, release.color);
            println!(
                "  Commit:   {} {}",
                release.revision.short(),
                release.revision.message.lines().next().unwrap_or("")
            );
            println!("  By:       {}", release.deployed_by);
            if let Some(at) = release.promoted_at {
                println!("  Since:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            for (service, port) in &release.ports {
                println!("  Port:     {} -> {}", service, port);
            }
            for (program, state) in &status.programs {
                println!("  Program:  {:<40} {}", program, state.as_str());
            }
        }
        None => println!("  Nothing live."),
    }
    if let Some(marker) = &status.in_flight {
        println!(
            "  In flight: {} {} at {} (pid {})",
            marker.kind.as_str(),
            marker.record_id,
            marker.stage,
            marker.pid
        );
    }
    if let Some(last) = &status.last_record
        && !last.is_live()
    {
        println!(
            "  Last attempt failed: {}",
            last.reason.as_deref().unwrap_or("unknown")
        );
    }
}

fn print_releases(releases: &[Release]) {
    if releases.is_empty() {
        println!("No releases.");
        return;
    }
    println!(
        "{:<32} {:<10} {:<11} {:<6} {:<12} Created",
        "Release", "Commit", "Status", "Color", "By"
    );
    println!("{}", "-".repeat(95));
    for release in releases {
        println!(
            "{:<32} {:<10} {:<11} {:<6} {:<12} {}",
            truncate(&release.id, 32),
            release.revision.short(),
            release.status.as_str(),
            release.color.as_str(),
            truncate(&release.deployed_by, 12),
            release.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_cleanup(report: &CleanupReport) {
    if report.is_noop() {
        println!("Nothing to clean up.");
        return;
    }
    if let Some(holder) = &report.reclaimed_lock {
        println!("Reclaimed stale lock held by {}", holder);
    }
    if let Some(record) = &report.abandoned {
        println!(
            "Closed out {} {}: {}",
            record.kind.as_str(),
            record.id,
            record.message.as_deref().unwrap_or("")
        );
    }
    if let Some(release) = &report.repromoted {
        println!("Re-promoted live release {}", release);
    }
    if !report.torn_down.is_empty() {
        println!("Stopped: {}", report.torn_down.join(", "));
    }
    if report.symlink_repaired {
        println!("Repaired current symlink");
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn step_symbol(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Ok => "OK",
        StepStatus::Failed => "FAILED",
        StepStatus::Warning => "WARN",
        StepStatus::Skipped => "SKIP",
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands, truncate};
    use clap::Parser;

    #[test]
    fn deploy_with_revision_and_timeout_parses() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "deploy",
            "checkout",
            "qa",
            "--revision",
            "abc123",
            "--timeout",
            "120",
        ])
        .unwrap();
        match cli.command {
            Commands::Deploy {
                revision, timeout, ..
            } => {
                assert_eq!(revision.as_deref(), Some("abc123"));
                assert_eq!(timeout, Some(120));
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn register_project_collects_envs() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "register-project",
            "checkout",
            "https://git.example.com/checkout.git",
            "--port-start",
            "8100",
            "--env",
            "qa",
            "--env",
            "prod",
        ])
        .unwrap();
        match cli.command {
            Commands::RegisterProject {
                port_start,
                environments,
                branch,
                ..
            } => {
                assert_eq!(port_start, 8100);
                assert_eq!(environments, vec!["qa", "prod"]);
                assert_eq!(branch, "main");
            }
            _ => panic!("expected register-project"),
        }
    }

    #[test]
    fn global_format_after_subcommand_parses() {
        let result = Cli::try_parse_from(["shipyard", "list", "--env", "qa", "--format", "json"]);
        assert!(result.is_ok());
    }

    #[test]
    fn deregister_force_flag_parses() {
        let result = Cli::try_parse_from(["shipyard", "deregister", "checkout", "--force"]);
        assert!(result.is_ok());
    }

    #[test]
    fn reset_deployments_parses() {
        let cli =
            Cli::try_parse_from(["shipyard", "reset-deployments", "checkout", "--force"]).unwrap();
        match cli.command {
            Commands::ResetDeployments { project, force } => {
                assert_eq!(project, "checkout");
                assert!(force);
            }
            _ => panic!("expected reset-deployments"),
        }
    }

    #[test]
    fn deploy_requires_environment() {
        let result = Cli::try_parse_from(["shipyard", "deploy", "checkout"]);
        assert!(result.is_err());
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("qa", 5), "qa");
        assert_eq!(truncate("20240101-120000-abc1234", 10), "2024010...");
    }
}
