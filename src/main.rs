// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentfleet main entry point - CLI over the orchestrator operations.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use agentfleet::config::{self, CliOptions, ResolvedConfig};
use agentfleet::error::FleetError;
use agentfleet::guard::{DuplicateGroup, MergeReport, OrphanReport};
use agentfleet::keys::DeployKey;
use agentfleet::orchestrator::{
    DestroyOutcome, Orchestrator, ProjectStatusReport, ProjectSummary, RouterReport, StartOptions,
    StartOutcome, StopOutcome,
};
use agentfleet::sandbox::SandboxInfo;
use agentfleet::state::{GlobalRouterState, ProjectStatus, RouterStatus, SandboxRecord};
use agentfleet::telemetry::{init_telemetry, TelemetryConfig};

/// Version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cumulative metrics file under the fleet home.
#[cfg(feature = "telemetry")]
const METRICS_FILE: &str = "metrics.json";

/// agentfleet - run coding agents per repository behind one router.
#[derive(Parser)]
#[command(name = "agentfleet")]
#[command(author, version, about = "Lifecycle orchestration for coding-agent servers", long_about = None)]
struct Cli {
    /// Fleet home directory (default: ~/.agentfleet, or AGENTFLEET_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Config file to use instead of <home>/config.{json,yaml}
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for project base directories
    #[arg(long, global = true)]
    projects_root: Option<PathBuf>,

    /// Health check budget in seconds
    #[arg(long, global = true)]
    health_timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Show info-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug logs with span timings
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for agentfleet.
#[derive(Subcommand)]
enum Commands {
    /// Manage projects (one agent per repository)
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage sandboxes (worktrees) of a project
    Sandbox {
        #[command(subcommand)]
        action: SandboxAction,
    },

    /// Show a project's deploy key and how to register it
    DeployKey {
        /// Repository URL
        url: String,
    },

    /// Manage the shared router
    Router {
        #[command(subcommand)]
        action: RouterAction,
    },

    /// Detect and repair inconsistent state
    Doctor {
        #[command(subcommand)]
        action: DoctorAction,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show cumulative operation metrics
    Metrics {
        /// Clear the collected metrics
        #[arg(long)]
        reset: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Clone if needed and start the agent
    Start {
        /// Repository URL (any accepted form)
        url: String,
        /// Base directory for a new project
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Preferred port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop the agent
    Stop { url: String },
    /// Stop and start again on the same port
    Restart { url: String },
    /// Stop, unregister and delete the working copy and record
    Destroy {
        url: String,
        /// Confirm deletion of the project directory
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show one project's status
    Status { url: String },
    /// List all projects
    List,
    /// Record the agent-assigned project id
    SetId { url: String, id: String },
}

#[derive(Subcommand)]
enum SandboxAction {
    /// Create a sandbox
    Create {
        url: String,
        name: String,
        /// Branch to start from (default: the clone's current branch)
        #[arg(long)]
        branch: Option<String>,
        /// Command to run inside the new sandbox
        #[arg(long)]
        start_command: Option<String>,
    },
    /// List sandboxes
    List { url: String },
    /// Delete a sandbox
    Delete { url: String, name: String },
    /// Discard changes and return to the default branch
    Reset { url: String, name: String },
}

#[derive(Subcommand)]
enum RouterAction {
    /// Start the router if projects are active
    Ensure,
    /// Restart the router on its port
    Restart,
    /// Stop the router (only with no active projects)
    Stop,
    /// Show router status
    Status,
}

#[derive(Subcommand)]
enum DoctorAction {
    /// Report repositories recorded under more than one key
    Duplicates {
        /// Merge them into the recommended record
        #[arg(long)]
        merge: bool,
    },
    /// Correct records claiming a process that is gone
    Orphans,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig::for_cli(cli.verbose, cli.debug);
    let _guard = match init_telemetry(&telemetry) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{} {}", "warning:".yellow().bold(), e);
            None
        }
    };

    if let Err(err) = run(cli).await {
        report_error(&err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let options = CliOptions {
        home: cli.home.clone(),
        config_file: cli.config.clone(),
        projects_root: cli.projects_root.clone(),
        health_timeout_secs: cli.health_timeout,
    };
    let json = cli.json;

    match cli.command {
        Commands::Version => {
            println!("agentfleet {}", VERSION);
            Ok(())
        }
        Commands::Config { action } => {
            let config = config::load_config(&options)?;
            match action {
                Some(ConfigAction::Show) | None => emit(json, &config, print_config)?,
            }
            Ok(())
        }
        Commands::Metrics { reset } => {
            let config = config::load_config(&options)?;
            handle_metrics(&config.home, reset, json)
        }
        command => {
            let config = config::load_config(&options)?;
            let secrets = config::load_secrets(&config.secrets_path())?;
            let home = config.home.clone();
            let orchestrator = Orchestrator::new(config, secrets)?;
            let result = handle_command(&orchestrator, command, json).await;
            save_metrics(&home);
            result
        }
    }
}

async fn handle_command(orchestrator: &Orchestrator, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Project { action } => handle_project(orchestrator, action, json).await,
        Commands::Sandbox { action } => handle_sandbox(orchestrator, action, json).await,
        Commands::DeployKey { url } => {
            let key = orchestrator.get_deploy_key(&url).await?;
            emit(json, &key, print_deploy_key)
        }
        Commands::Router { action } => handle_router(orchestrator, action, json).await,
        Commands::Doctor { action } => handle_doctor(orchestrator, action, json).await,
        Commands::Config { .. } | Commands::Metrics { .. } | Commands::Version => Ok(()),
    }
}

async fn handle_project(orchestrator: &Orchestrator, action: ProjectAction, json: bool) -> anyhow::Result<()> {
    match action {
        ProjectAction::Start { url, base_dir, port } => {
            let options = StartOptions { base_dir, port };
            let outcome = orchestrator.start(&url, options).await?;
            emit(json, &outcome, print_start_outcome)
        }
        ProjectAction::Stop { url } => {
            let outcome = orchestrator.stop(&url).await?;
            emit(json, &outcome, print_stop_outcome)
        }
        ProjectAction::Restart { url } => {
            let outcome = orchestrator.restart(&url).await?;
            emit(json, &outcome, print_start_outcome)
        }
        ProjectAction::Destroy { url, yes } => {
            if !yes {
                anyhow::bail!("destroy deletes the project directory; pass --yes to confirm");
            }
            let outcome = orchestrator.destroy(&url).await?;
            emit(json, &outcome, print_destroy_outcome)
        }
        ProjectAction::Status { url } => {
            let report = orchestrator.status(&url).await?;
            emit(json, &report, print_status_report)
        }
        ProjectAction::List => {
            let projects = orchestrator.list().await?;
            emit(json, &projects, |p| print_project_list(p))
        }
        ProjectAction::SetId { url, id } => {
            let record = orchestrator.set_project_id(&url, &id).await?;
            emit(json, &record, |r| {
                println!(
                    "{} {} -> {}",
                    "✓".green(),
                    r.repo_url,
                    r.project_id.as_deref().unwrap_or("(cleared)")
                );
            })
        }
    }
}

async fn handle_sandbox(orchestrator: &Orchestrator, action: SandboxAction, json: bool) -> anyhow::Result<()> {
    match action {
        SandboxAction::Create {
            url,
            name,
            branch,
            start_command,
        } => {
            let record = orchestrator
                .create_sandbox(&url, &name, branch.as_deref(), start_command.as_deref())
                .await?;
            emit(json, &record, |r| print_sandbox("Created", r))
        }
        SandboxAction::List { url } => {
            let sandboxes = orchestrator.list_sandboxes(&url).await?;
            emit(json, &sandboxes, |s| print_sandbox_list(s))
        }
        SandboxAction::Delete { url, name } => {
            let record = orchestrator.delete_sandbox(&url, &name).await?;
            emit(json, &record, |r| print_sandbox("Deleted", r))
        }
        SandboxAction::Reset { url, name } => {
            let record = orchestrator.reset_sandbox(&url, &name).await?;
            emit(json, &record, |r| print_sandbox("Reset", r))
        }
    }
}

async fn handle_router(orchestrator: &Orchestrator, action: RouterAction, json: bool) -> anyhow::Result<()> {
    match action {
        RouterAction::Ensure => {
            let state = orchestrator.ensure_router_running().await?;
            emit(json, &state, print_router_state)
        }
        RouterAction::Restart => {
            let state = orchestrator.restart_router().await?;
            emit(json, &state, print_router_state)
        }
        RouterAction::Stop => {
            let state = orchestrator.stop_router().await?;
            emit(json, &state, print_router_state)
        }
        RouterAction::Status => {
            let report = orchestrator.router_status().await?;
            emit(json, &report, print_router_report)
        }
    }
}

async fn handle_doctor(orchestrator: &Orchestrator, action: DoctorAction, json: bool) -> anyhow::Result<()> {
    match action {
        DoctorAction::Duplicates { merge: false } => {
            let groups = orchestrator.detect_duplicates().await?;
            emit(json, &groups, |g| print_duplicates(g))
        }
        DoctorAction::Duplicates { merge: true } => {
            let report = orchestrator.merge_duplicates().await?;
            emit(json, &report, print_merge_report)
        }
        DoctorAction::Orphans => {
            let report = orchestrator.cleanup_orphaned().await?;
            emit(json, &report, print_orphan_report)
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// Print `value` as JSON or through `text`.
fn emit<T: Serialize + ?Sized>(json: bool, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn report_error(err: &anyhow::Error) {
    eprintln!("{} {}", "error:".red().bold(), err);
    if let Some(fleet) = err.downcast_ref::<FleetError>() {
        if fleet.is_retryable() {
            eprintln!("{}", "This may succeed if retried.".dimmed());
        }
    }
}

fn status_label(status: ProjectStatus) -> colored::ColoredString {
    match status {
        ProjectStatus::Running => status.as_str().green().bold(),
        ProjectStatus::Starting | ProjectStatus::Stopping => status.as_str().yellow(),
        ProjectStatus::Stopped => status.as_str().dimmed(),
        ProjectStatus::Failed => status.as_str().red().bold(),
    }
}

fn router_label(status: RouterStatus) -> colored::ColoredString {
    match status {
        RouterStatus::Running => status.as_str().green().bold(),
        RouterStatus::Starting | RouterStatus::Stopping => status.as_str().yellow(),
        RouterStatus::Idle => status.as_str().dimmed(),
        RouterStatus::Failed => status.as_str().red().bold(),
    }
}

fn print_summary(project: &ProjectSummary) {
    println!("{} {}", project.display_name.bold(), status_label(project.status));
    println!("  key:  {}", project.key);
    if let Some(ref url) = project.url {
        println!("  url:  {}", url);
    }
    if let Some(pid) = project.pid {
        let liveness = if project.alive { "alive".green() } else { "dead".red() };
        println!("  pid:  {} ({})", pid, liveness);
    }
    println!("  dir:  {}", project.base_dir.display());
    if !project.sandboxes.is_empty() {
        println!("  sandboxes: {}", project.sandboxes.join(", "));
    }
    if let Some(ref err) = project.last_error {
        println!("  last: {}", err.red());
    }
}

fn print_start_outcome(outcome: &StartOutcome) {
    match outcome {
        StartOutcome::Started { project, router_error } => {
            println!("{} Started", "✓".green());
            print_summary(project);
            if let Some(err) = router_error {
                println!("{} router: {}", "!".yellow().bold(), err);
            }
        }
        StartOutcome::AlreadyRunning { project, router_error } => {
            println!("{} Already running", "✓".green());
            print_summary(project);
            if let Some(err) = router_error {
                println!("{} router: {}", "!".yellow().bold(), err);
            }
        }
        StartOutcome::AwaitingCredential { deploy_key } => {
            println!("{} Repository access denied; register this deploy key:", "!".yellow().bold());
            print_deploy_key(deploy_key);
        }
    }
}

fn print_stop_outcome(outcome: &StopOutcome) {
    let what = if outcome.was_running { "Stopped" } else { "Already stopped" };
    println!("{} {} {}", "✓".green(), what, outcome.key);
    println!("  active projects: {}", outcome.active_projects);
    if outcome.router_stopped {
        println!("  router stopped");
    }
}

fn print_destroy_outcome(outcome: &DestroyOutcome) {
    println!("{} Destroyed {}", "✓".green(), outcome.key);
    if let Some(ref dir) = outcome.removed_dir {
        println!("  removed {}", dir.display());
    }
    println!("  active projects: {}", outcome.stop.active_projects);
}

fn print_status_report(report: &ProjectStatusReport) {
    if report.crashed {
        println!("{} process was gone; marked failed", "!".red().bold());
    }
    print_summary(&report.project);
    if let Some(ref id) = report.record.project_id {
        println!("  project id: {}", id);
    }
    if let Some(ref health) = report.health {
        let label = if health.healthy { "healthy".green() } else { "unhealthy".red() };
        println!("  health: {} ({})", label, health.message);
    }
    match report.router_entry {
        Some(ref entry) if entry.is_active() => println!("  router: {}", "active".green()),
        Some(_) => println!("  router: {}", "inactive".dimmed()),
        None => println!("  router: {}", "not registered".dimmed()),
    }
}

fn print_project_list(projects: &[ProjectSummary]) {
    if projects.is_empty() {
        println!("No projects.");
        return;
    }
    for project in projects {
        let port = project.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<10} {:>5}  {}",
            project.display_name,
            status_label(project.status),
            port,
            project.key.dimmed()
        );
    }
}

fn print_deploy_key(key: &DeployKey) {
    println!("{}", key.public_key.bold());
    println!("  private key: {}", key.private_key_path.display());
    for (i, step) in key.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
}

fn print_sandbox(verb: &str, record: &SandboxRecord) {
    println!("{} {} sandbox {}", "✓".green(), verb, record.name.bold());
    println!("  branch: {} (from {})", record.branch, record.base_branch);
    println!("  path:   {}", record.path.display());
}

fn print_sandbox_list(sandboxes: &[SandboxInfo]) {
    if sandboxes.is_empty() {
        println!("No sandboxes.");
        return;
    }
    for info in sandboxes {
        let missing = if info.exists { "".normal() } else { " (missing)".red() };
        println!(
            "{:<24} {:<32} {}{}",
            info.record.name,
            info.record.branch,
            info.record.path.display(),
            missing
        );
    }
}

fn print_router_state(state: &GlobalRouterState) {
    println!("router {}", router_label(state.status));
    if let Some(port) = state.port {
        println!("  port: {}", port);
    }
    if let Some(pid) = state.pid {
        println!("  pid:  {}", pid);
    }
    println!("  active projects: {}", state.active_project_count);
    if let Some(ref err) = state.last_error {
        println!("  last: {}", err.red());
    }
}

fn print_router_report(report: &RouterReport) {
    print_router_state(&report.state);
    if let Some(ref url) = report.url {
        println!("  url:  {}", url);
    }
    let liveness = if report.alive { "alive".green() } else { "not running".dimmed() };
    println!("  process: {}", liveness);
    if let Some(ref health) = report.health {
        let label = if health.healthy { "healthy".green() } else { "unhealthy".red() };
        println!("  health: {} ({})", label, health.message);
    }
}

fn print_duplicates(groups: &[DuplicateGroup]) {
    if groups.is_empty() {
        println!("{} No duplicates.", "✓".green());
        return;
    }
    for group in groups {
        println!("{}", group.normalized_url.bold());
        for entry in &group.entries {
            let marker = if entry.key == group.keep { "keep".green() } else { "drop".yellow() };
            println!("  [{}] {} {}", marker, entry.key, status_label(entry.status));
        }
    }
    println!("Run with --merge to apply.");
}

fn print_merge_report(report: &MergeReport) {
    if report.groups.is_empty() {
        println!("{} No duplicates.", "✓".green());
        return;
    }
    println!("{} Merged {} group(s)", "✓".green(), report.groups.len());
    for key in &report.removed_keys {
        println!("  removed {}", key);
    }
    for pid in &report.terminated_pids {
        println!("  terminated pid {}", pid);
    }
    println!("  active projects: {}", report.active_projects);
}

fn print_orphan_report(report: &OrphanReport) {
    if report.is_clean() {
        println!("{} No orphans.", "✓".green());
    }
    for key in &report.corrected {
        println!("{} {} marked stopped", "!".yellow().bold(), key);
    }
    if report.router_corrected {
        println!("{} router marked failed", "!".yellow().bold());
    }
    println!("  active projects: {}", report.active_projects);
}

fn print_config(config: &ResolvedConfig) {
    // Secrets live in their own file and never appear here.
    println!("{} {}", "home:".bold(), config.home.display());
    println!("{} {}", "projects root:".bold(), config.projects_root.display());
    match serde_yaml::to_string(config) {
        Ok(yaml) => print!("{}", yaml),
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Fold this run's metrics into the cumulative file.
#[cfg(feature = "telemetry")]
fn save_metrics(home: &Path) {
    use agentfleet::persist;
    use agentfleet::telemetry::{MetricsSnapshot, GLOBAL_METRICS};

    let current = GLOBAL_METRICS.snapshot();
    if current.is_empty() {
        return;
    }
    let path = home.join(METRICS_FILE);
    let mut total = persist::read_json::<MetricsSnapshot>(&path)
        .ok()
        .flatten()
        .unwrap_or_default();
    total.merge(&current);
    if let Err(e) = persist::atomic_write_json(&path, &total) {
        tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
    }
}

#[cfg(not(feature = "telemetry"))]
fn save_metrics(_home: &Path) {}

#[cfg(feature = "telemetry")]
fn handle_metrics(home: &Path, reset: bool, json: bool) -> anyhow::Result<()> {
    use agentfleet::persist;
    use agentfleet::telemetry::MetricsSnapshot;

    let path = home.join(METRICS_FILE);
    if reset {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        println!("{} Metrics cleared", "✓".green());
        return Ok(());
    }

    let snapshot = persist::read_json::<MetricsSnapshot>(&path)?.unwrap_or_default();
    emit(json, &snapshot, |s| {
        if s.is_empty() {
            println!("No metrics recorded yet.");
        } else {
            print!("{}", s.format_report());
        }
    })
}

#[cfg(not(feature = "telemetry"))]
fn handle_metrics(_home: &Path, _reset: bool, _json: bool) -> anyhow::Result<()> {
    println!("Metrics are disabled in this build (telemetry feature off).");
    Ok(())
}
