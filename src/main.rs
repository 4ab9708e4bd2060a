//! devrack command-line front end.
//!
//! Parses arguments, loads the descriptor and settings files, and hands the selected apps
//! to the orchestrator. Reports go to stdout; logs go to stderr.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use devrack::backend::{self, BackendKind};
use devrack::config::{self, Config, Settings, DEFAULT_SETTINGS_FILE};
use devrack::ports::LsofProbe;
use devrack::store::DEFAULT_APPS_FILE;
use devrack::{
    AppDescriptor, AppReport, ConfigStore, ConflictPolicy, Operation, Orchestrator,
    OrchestratorOptions,
};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Start, stop, restart and update local web apps in named sessions",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the app descriptor file.
    #[arg(long, global = true)]
    apps: Option<PathBuf>,
    /// Path to devrack.toml settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Session backend to use.
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendKind>,
    /// Name of the shared tmux session.
    #[arg(long, global = true)]
    session: Option<String>,
    /// Print the commands that would run without touching sessions or processes.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Resolve session and port conflicts without asking.
    #[arg(short, long, global = true)]
    yes: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured apps.
    List,
    /// Show whether apps are running, stopped or blocked by another process.
    Status(Selection),
    /// Start apps in new sessions.
    Start(Selection),
    /// Stop apps and free their ports.
    Stop(Selection),
    /// Restart apps, in place when the backend allows it.
    Restart(Selection),
    /// Stop, pull, sync dependencies and start again.
    Update(Selection),
    /// Print the launch command for apps.
    Command(Selection),
}

#[derive(Debug, Args)]
struct Selection {
    /// App names (case-insensitive).
    names: Vec<String>,
    /// Select every configured app.
    #[arg(long, conflicts_with = "names")]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let settings = load_settings(&cli)?;
    let apps_path = cli
        .apps
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_APPS_FILE));
    let store = ConfigStore::load(&apps_path)?;
    debug!(path = %apps_path.display(), apps = store.apps().len(), "loaded descriptors");

    let options = OrchestratorOptions {
        dry_run: cli.dry_run,
        conflict_policy: if cli.yes {
            ConflictPolicy::Force
        } else {
            ConflictPolicy::Refuse
        },
        ..OrchestratorOptions::from(&settings)
    };
    let orchestrator = Orchestrator::new(
        backend::from_settings(&settings),
        Box::new(LsofProbe::default()),
        options,
    );

    let (op, selection) = match &cli.command {
        Commands::List => {
            list_apps(&store);
            return Ok(());
        }
        Commands::Status(selection) => {
            let apps = select_apps(&store, selection, true)?;
            for (name, status) in orchestrator.statuses(&apps).await {
                println!("{name}: {status}");
            }
            return Ok(());
        }
        Commands::Command(selection) => {
            let apps = select_apps(&store, selection, false)?;
            return print_commands(&orchestrator, &apps);
        }
        Commands::Start(selection) => (Operation::Start, selection),
        Commands::Stop(selection) => (Operation::Stop, selection),
        Commands::Restart(selection) => (Operation::Restart, selection),
        Commands::Update(selection) => (Operation::Update, selection),
    };

    let apps = select_apps(&store, selection, false)?;
    if apps.is_empty() {
        warn!(path = %apps_path.display(), "no apps configured");
        return Ok(());
    }
    let policy = orchestrator.options().conflict_policy;
    let mut reports = orchestrator.run_all(op, &apps, policy).await;
    if policy == ConflictPolicy::Refuse && io::stdin().is_terminal() {
        resolve_conflicts(&orchestrator, op, &apps, &mut reports).await?;
    }

    let failed = print_reports(&reports, cli.dry_run);
    if failed > 0 {
        bail!("{failed} of {} operations failed", reports.len());
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("DEVRACK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut config = Config::default();
    if !cli.no_config {
        let config_path = cli
            .config
            .clone()
            .or_else(|| default_config_path().filter(|path| path.exists()));
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
        }
    }
    Ok(Settings::resolve(apply_overrides(config, cli)))
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_SETTINGS_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if cli.backend.is_some() {
        config.backend = cli.backend;
    }
    if cli.session.is_some() {
        config.tmux_session = cli.session.clone();
    }
    config
}

fn select_apps(
    store: &ConfigStore,
    selection: &Selection,
    default_all: bool,
) -> Result<Vec<AppDescriptor>> {
    if selection.all || (default_all && selection.names.is_empty()) {
        return Ok(store.apps().to_vec());
    }
    if selection.names.is_empty() {
        bail!("name at least one app, or pass --all");
    }
    Ok(store.select(&selection.names)?)
}

fn list_apps(store: &ConfigStore) {
    for app in store.apps() {
        let port = app
            .port
            .map(|port| port.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            app.name,
            app.kind,
            port,
            app.working_dir.display()
        );
    }
}

fn print_commands(orchestrator: &Orchestrator, apps: &[AppDescriptor]) -> Result<()> {
    let mut failed = 0;
    for app in apps {
        match orchestrator.command_for(app) {
            Ok(built) => println!("{}: {}", app.name, built.line),
            Err(err) => {
                println!("{}: {err}", app.name);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} commands could not be built", apps.len());
    }
    Ok(())
}

// Offers to force each conflicted app, one prompt per app.
async fn resolve_conflicts(
    orchestrator: &Orchestrator,
    op: Operation,
    apps: &[AppDescriptor],
    reports: &mut [AppReport],
) -> Result<()> {
    for (app, report) in apps.iter().zip(reports.iter_mut()) {
        if !report.is_conflict() {
            continue;
        }
        let question = format!("{}: {}. Stop it and continue?", report.name, report.outcome);
        if confirm(&question)? {
            info!(app = %app.name, "forcing after confirmation");
            *report = orchestrator.run(op, app, ConflictPolicy::Force).await;
        }
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "{question} [y/N] ")?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Prints one block per report and returns how many failed.
fn print_reports(reports: &[AppReport], show_commands: bool) -> usize {
    for report in reports {
        println!("{report}");
        if show_commands {
            if let Some(command) = &report.command {
                println!("  $ {command}");
            }
        }
    }
    reports
        .iter()
        .filter(|report| report.outcome.is_failure())
        .count()
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
