//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use devstation::core::config::Config;
use devstation::core::errors::DvsError;
use devstation::core::paths::{expand_tilde, home_dir, resolve_absolute_path};
use devstation::installer::SystemFetcher;
use devstation::installer::cleanup::StepOutcome;
use devstation::logger::ActivityLog;
use devstation::orchestrator::{
    CancelFlag, ComponentReport, ComponentState, Orchestrator, ProgressSink, RunOptions,
    RunSummary, SilentProgress, StatusRow,
};
use devstation::platform::env::Environment;
use devstation::platform::pal::{CommandRunner, HostFacts, SystemRunner, is_root};
use devstation::probe::HealthCheck;
use devstation::profile::ProfileMutator;
use devstation::registry::Registry;

/// devstation: idempotent development workstation provisioner.
#[derive(Debug, Parser)]
#[command(
    name = "devstation",
    author,
    version,
    about = "Provision and verify a development workstation",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Shell profile to manage (default: ~/.bashrc).
    #[arg(long, global = true, value_name = "PATH")]
    profile: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Install, repair and configure every managed component.
    Provision(ProvisionArgs),
    /// Probe every component and print its health.
    Status(SelectArgs),
    /// Print the tiered install order.
    Plan(SelectArgs),
    /// Remove one component's files, packages, caches and profile block.
    Clean(CleanArgs),
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct ProvisionArgs {
    /// Only these components (comma separated) plus their dependencies.
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    only: Vec<String>,
    /// Probe only; report what would be installed.
    #[arg(long)]
    dry_run: bool,
    /// Maximum concurrent installs of independent optional components.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    jobs: Option<u16>,
    /// Per-component fetch timeout in seconds.
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    fetch_timeout: Option<u64>,
    /// Run on hosts that are not Debian-family.
    #[arg(long)]
    skip_host_check: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct SelectArgs {
    /// Only these components (comma separated) plus their dependencies.
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    only: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct CleanArgs {
    /// Component to clean.
    #[arg(value_name = "NAME")]
    name: String,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure, including unsatisfied required components.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The run was interrupted by a signal.
    #[error("{0}")]
    Cancelled(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Cancelled(_) => 4,
        }
    }
}

impl From<DvsError> for CliError {
    fn from(error: DvsError) -> Self {
        match error {
            DvsError::InvalidConfig { .. }
            | DvsError::MissingConfig { .. }
            | DvsError::ConfigParse { .. } => Self::User(error.to_string()),
            DvsError::InvalidRegistry { .. } | DvsError::Serialization { .. } => {
                Self::Internal(error.to_string())
            }
            DvsError::Cancelled => Self::Cancelled(error.to_string()),
            _ => Self::Runtime(error.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Provision(args) => run_provision(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::Plan(args) => run_plan(cli, args),
        Command::Clean(args) => run_clean(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── provision ────────────────────

fn run_provision(cli: &Cli, args: &ProvisionArgs) -> Result<(), CliError> {
    let mode = output_mode(cli);
    let config = load_config(cli)?;
    let registry = config.registry()?;
    let host = detect_host(args.skip_host_check)?;

    let mut options = RunOptions::from_config(&config);
    options.only = selection(&args.only);
    options.dry_run |= args.dry_run;
    if let Some(jobs) = args.jobs {
        options.jobs = usize::from(jobs);
    }
    if let Some(secs) = args.fetch_timeout {
        options.fetch_timeout = std::time::Duration::from_secs(secs);
    }

    if !options.dry_run && !is_root() && !cli.quiet {
        eprintln!(
            "{} not running as root; system paths and apt installs will fail",
            "warning:".yellow().bold()
        );
    }

    let log = ActivityLog::open(&config.paths.activity_log);
    let console = ConsoleProgress {
        verbose: cli.verbose,
    };
    let progress: &dyn ProgressSink = if mode == OutputMode::Json || cli.quiet {
        &SilentProgress
    } else {
        &console
    };
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let fetcher = SystemFetcher::new(Arc::clone(&runner));
    let profile = ProfileMutator::new(&config.profile.path)
        .with_backup(config.profile.backup && !options.dry_run);

    let summary = Orchestrator::new(&registry, &host, runner.as_ref(), &fetcher)
        .with_options(options)
        .with_log(&log)
        .with_progress(progress)
        .with_cancel(CancelFlag::with_signal_hooks())
        .run(profile, Environment::from_process())?;

    match mode {
        OutputMode::Human => {
            if !cli.quiet {
                print_summary(&summary, &config);
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "provision",
                "success": summary.success(),
                "profile": config.profile.path.to_string_lossy(),
                "summary": serde_json::to_value(&summary)?,
            });
            write_json_line(&payload)?;
        }
    }

    summary_result(&summary)
}

/// Map a finished run onto the exit-code contract.
fn summary_result(summary: &RunSummary) -> Result<(), CliError> {
    if summary.cancelled {
        return Err(CliError::Cancelled("run cancelled".to_string()));
    }
    if summary.aborted {
        return Err(CliError::Runtime(format!(
            "run aborted: {}",
            summary.abort_reason.as_deref().unwrap_or("unknown error")
        )));
    }
    if !summary.success() {
        let names: Vec<&str> = summary
            .unsatisfied_required()
            .map(|c| c.name.as_str())
            .collect();
        return Err(CliError::Runtime(format!(
            "required components not satisfied: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, config: &Config) {
    println!();
    println!(
        "  {:<16}  {:<8}  {:<18}  {}",
        "Component", "Required", "State", "Outcome"
    );
    println!("  {}", "-".repeat(72));
    for report in &summary.components {
        println!(
            "  {:<16}  {:<8}  {}  {}",
            report.name,
            if report.required { "yes" } else { "no" },
            state_badge(report.state),
            report.outcome,
        );
    }

    let counts = summary.counts();
    println!();
    println!(
        "{} already satisfied, {} installed, {} skipped, {} failed ({:.1}s)",
        counts.already_satisfied,
        counts.installed,
        counts.skipped,
        counts.failed,
        summary.duration_ms as f64 / 1000.0,
    );
    if let Some(backup) = &summary.profile_backup {
        println!("Profile backup: {backup}");
    }
    if counts.installed > 0 && !summary.dry_run {
        println!(
            "Open a new shell or run `source {}` to pick up the changes.",
            config.profile.path.display()
        );
    }
}

fn state_badge(state: ComponentState) -> String {
    let label = format!("{:<18}", state.as_str());
    match state {
        ComponentState::Satisfied => label.green().to_string(),
        ComponentState::Failed => label.red().bold().to_string(),
        ComponentState::SkippedDependency => label.yellow().to_string(),
        _ => label.dimmed().to_string(),
    }
}

/// Live progress on stderr.
struct ConsoleProgress {
    verbose: bool,
}

impl ProgressSink for ConsoleProgress {
    fn state_changed(&self, component: &str, state: ComponentState) {
        if self.verbose {
            eprintln!("  {} {component}: {state}", "·".dimmed());
        }
    }

    fn probed(&self, component: &str, health: &HealthCheck) {
        if self.verbose {
            eprintln!("  {} {component}: {health}", "?".dimmed());
        }
    }

    fn finished(&self, report: &ComponentReport) {
        let marker = match report.state {
            ComponentState::Satisfied => "ok".green().bold(),
            ComponentState::Failed => "FAIL".red().bold(),
            ComponentState::SkippedDependency => "skip".yellow(),
            _ => "--".dimmed(),
        };
        eprintln!("[{marker}] {}: {}", report.name, report.outcome);
    }
}

// ──────────────────── status / plan / clean ────────────────────

fn run_status(cli: &Cli, args: &SelectArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = config.registry()?;
    let host = HostFacts::detect().unwrap_or_else(|_| HostFacts::fallback());
    let fetcher = SystemFetcher::new(Arc::new(SystemRunner));
    let options = RunOptions {
        only: selection(&args.only),
        ..RunOptions::from_config(&config)
    };
    let profile = ProfileMutator::new(&config.profile.path);
    let rows = Orchestrator::new(&registry, &host, &SystemRunner, &fetcher)
        .with_options(options)
        .status(&profile, Environment::from_process())?;

    match output_mode(cli) {
        OutputMode::Human => print_status(&rows, &config),
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "profile": config.profile.path.to_string_lossy(),
                "components": serde_json::to_value(&rows)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_status(rows: &[StatusRow], config: &Config) {
    println!("devstation v{}", env!("CARGO_PKG_VERSION"));
    println!("  Profile: {}", config.profile.path.display());
    println!();
    println!(
        "  {:<16}  {:<10}  {:<7}  {:<10}  {}",
        "Component", "Desired", "Block", "Health", "Detail"
    );
    println!("  {}", "-".repeat(72));
    for row in rows {
        let health = format!("{:<10}", row.health.label());
        let health = match row.health {
            HealthCheck::PresentAndHealthy { .. } => health.green(),
            HealthCheck::PresentButUnhealthy { .. } => health.yellow(),
            HealthCheck::Absent => health.red(),
        };
        let detail = match &row.health {
            HealthCheck::PresentAndHealthy { version } => version.clone(),
            HealthCheck::PresentButUnhealthy { detail } => detail.clone(),
            HealthCheck::Absent => String::new(),
        };
        let name = if row.enabled {
            row.name.clone()
        } else {
            format!("{} (off)", row.name)
        };
        println!(
            "  {:<16}  {:<10}  {:<7}  {health}  {detail}",
            name,
            row.desired,
            if row.profile_block { "yes" } else { "no" },
        );
    }
}

fn run_plan(cli: &Cli, args: &SelectArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = config.registry()?;
    let plan = registry.plan(selection(&args.only).as_deref())?;

    match output_mode(cli) {
        OutputMode::Human => {
            for (i, tier) in plan.tiers.iter().enumerate() {
                let names: Vec<String> = tier
                    .iter()
                    .map(|name| describe_planned(&registry, name))
                    .collect();
                println!("tier {i}: {}", names.join(", "));
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "plan",
                "tiers": plan.tiers,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn describe_planned(registry: &Registry, name: &str) -> String {
    match registry.get(name) {
        Some(c) if c.required => format!("{} {}", name.bold(), c.version),
        Some(c) if !c.enabled => format!("{name} {} (disabled)", c.version),
        Some(c) => format!("{name} {}", c.version),
        None => name.to_string(),
    }
}

fn run_clean(cli: &Cli, args: &CleanArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let registry = config.registry()?;
    if !registry.contains(&args.name) {
        return Err(CliError::User(format!("unknown component {:?}", args.name)));
    }
    let host = HostFacts::detect().unwrap_or_else(|_| HostFacts::fallback());
    let log = ActivityLog::open(&config.paths.activity_log);
    let fetcher = SystemFetcher::new(Arc::new(SystemRunner));
    let profile = ProfileMutator::new(&config.profile.path).with_backup(config.profile.backup);

    let report = Orchestrator::new(&registry, &host, &SystemRunner, &fetcher)
        .with_options(RunOptions::from_config(&config))
        .with_log(&log)
        .clean(&args.name, profile, Environment::from_process())?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                for step in &report.steps {
                    let status = match &step.outcome {
                        StepOutcome::Removed => "removed".green().to_string(),
                        StepOutcome::Absent => "absent".dimmed().to_string(),
                        StepOutcome::Failed(reason) => format!("{} ({reason})", "failed".red()),
                    };
                    println!("  {:<12} {:<48} {status}", step.stage.as_str(), step.target);
                }
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "clean",
                "report": serde_json::to_value(&report)?,
            });
            write_json_line(&payload)?;
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        return Err(CliError::Runtime(format!(
            "cleanup of {} finished with {failed} failed step(s)",
            args.name
        )));
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match load_config(cli) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── helpers ────────────────────

/// Load config, then apply `--profile`.
fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(profile) = &cli.profile {
        config.profile.path = resolve_absolute_path(&expand_tilde(
            &profile.to_string_lossy(),
            home_dir().as_deref(),
        ));
        config.validate()?;
    }
    Ok(config)
}

fn detect_host(skip_check: bool) -> Result<HostFacts, CliError> {
    match HostFacts::detect() {
        Ok(host) if host.is_debian_family() || skip_check => Ok(host),
        Ok(host) => Err(DvsError::UnsupportedPlatform {
            details: format!(
                "{} is not Debian-family (pass --skip-host-check to continue anyway)",
                if host.distro.is_empty() { "unknown" } else { host.distro.as_str() }
            ),
        }
        .into()),
        Err(_) if skip_check => Ok(HostFacts::fallback()),
        Err(e) => Err(DvsError::UnsupportedPlatform {
            details: format!("cannot identify host: {e}"),
        }
        .into()),
    }
}

fn selection(names: &[String]) -> Option<Vec<String>> {
    let names: Vec<String> = names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    (!names.is_empty()).then_some(names)
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DEVSTATION_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
