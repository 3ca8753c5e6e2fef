//! Benchmark Campaign Controller
//!
//! Runs a plan of benchmark experiments against a real-time target board:
//! for every experiment it rebuilds the firmware, resets the board, records
//! the telemetry the board prints over serial and moves on once enough
//! iterations were observed or the board stalled.
//!
//! # Features
//!
//! - **Telemetry capture**: follows `iteration: <n>` lines and stores each
//!   experiment's in-sequence readings in its own file
//!   (requires `serial` feature and libudev on Linux)
//! - **Watchdog**: resets the target through a second serial line when an
//!   experiment is complete or has stalled
//! - **Operator menu**: skip, reset, reconnect or redirect output while the
//!   campaign runs
//!
//! # Usage
//!
//! ```bash
//! # Write a default campaign configuration
//! benchctl config generate -o campaign.toml
//!
//! # Check an experiment plan
//! benchctl plan check experiments.csv
//!
//! # List available serial ports (requires serial feature)
//! benchctl ports list
//!
//! # Run the campaign
//! benchctl run --plan experiments.csv --config campaign.toml \
//!     --telemetry-port /dev/ttyUSB1 --reset-port /dev/ttyUSB0
//! ```

mod config;
mod console;
mod driver;
mod exclusion;
mod firmware;
mod link;
mod menu;
mod plan;
#[cfg(feature = "serial")]
mod serial;
mod telemetry;
mod terminal;
mod watchdog;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::CampaignConfig;
use console::Console;
use driver::{CampaignSummary, DriverOptions, ExperimentDriver};
use firmware::{FirmwareBuild, MakeBuild, SkipBuild};
use menu::MenuInput;
use telemetry::TelemetryReader;
use terminal::TerminalKeys;
use watchdog::Watchdog;

/// How often the menu thread wakes up to check for shutdown
const MENU_POLL: Duration = Duration::from_millis(100);

/// Log file kept in the output directory while a campaign runs
const RUN_LOG_FILE: &str = "benchctl.log";

/// Benchmark Campaign Controller
///
/// Automates benchmark experiments on an embedded target over serial
#[derive(Parser)]
#[command(name = "benchctl")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "Benchmark campaign controller for embedded targets")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write diagnostic logs to a file (`run` defaults to
    /// <output directory>/benchctl.log, other commands to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment campaign
    Run(RunArgs),

    /// Experiment plan operations
    #[command(subcommand)]
    Plan(PlanCommands),

    /// Serial port operations (requires --features serial)
    #[cfg(feature = "serial")]
    #[command(subcommand)]
    Ports(PortCommands),

    /// Campaign configuration operations
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Experiment plan (.csv or .toml)
    #[arg(short, long)]
    plan: PathBuf,

    /// Campaign configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the target's telemetry console
    #[arg(long)]
    telemetry_port: Option<String>,

    /// Serial port of the reset controller
    #[arg(long)]
    reset_port: Option<String>,

    /// Iterations to exceed before an experiment is complete
    #[arg(long)]
    min_observations: Option<u32>,

    /// Seconds without progress before the target is reset
    #[arg(long)]
    stall_timeout: Option<u64>,

    /// Directory for telemetry output files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Do not rebuild the firmware between experiments
    #[arg(long)]
    skip_build: bool,

    /// Run without the interactive menu
    #[arg(long)]
    no_menu: bool,
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Parse and validate an experiment plan
    Check {
        /// Path to the plan (.csv or .toml)
        path: PathBuf,

        /// Campaign configuration (for the number of benchmark kinds)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(feature = "serial")]
#[derive(Subcommand)]
enum PortCommands {
    /// List available serial ports
    List,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default campaign configuration
    Generate {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // `run` owns the terminal, so its logger is set up once the output
    // directory is known
    if !matches!(cli.command, Commands::Run(_)) {
        init_logging(cli.verbose, cli.log_file.as_deref())?;
    }

    match cli.command {
        Commands::Run(args) => handle_run(args, cli.verbose, cli.log_file),
        Commands::Plan(cmd) => handle_plan(cmd),
        #[cfg(feature = "serial")]
        Commands::Ports(cmd) => handle_ports(cmd),
        Commands::Config(cmd) => handle_config(cmd),
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Where `run` sends its log: stderr would tear the status line and
/// prompts, so it always goes to a file
fn run_log_path(log_file: Option<PathBuf>, output_dir: &Path) -> PathBuf {
    log_file.unwrap_or_else(|| output_dir.join(RUN_LOG_FILE))
}

fn load_config(path: Option<&Path>) -> Result<CampaignConfig> {
    match path {
        Some(p) => CampaignConfig::load(p)
            .with_context(|| format!("Failed to load configuration {}", p.display())),
        None => Ok(CampaignConfig::default()),
    }
}

fn handle_run(args: RunArgs, verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(port) = args.telemetry_port {
        config.telemetry.port = port;
    }
    if let Some(port) = args.reset_port {
        config.reset.port = port;
    }
    if let Some(min) = args.min_observations {
        config.watchdog.min_observations = min;
    }
    if let Some(secs) = args.stall_timeout {
        config.watchdog.stall_timeout_secs = secs;
    }
    if let Some(dir) = args.output_dir {
        config.output.directory = dir;
    }
    if args.skip_build {
        config.build.enabled = false;
    }
    config.validate()?;

    let log_path = run_log_path(log_file, &config.output.directory);
    init_logging(verbose, Some(&log_path))?;
    println!(
        "{} Diagnostics are logged to {}",
        "[*]".cyan().bold(),
        log_path.display()
    );

    let plan = plan::load(&args.plan, config.build.benchmark_kinds)
        .with_context(|| format!("Failed to load plan {}", args.plan.display()))?;

    println!(
        "{} {} experiments from {}",
        "[*]".cyan().bold(),
        plan.len(),
        args.plan.display().to_string().white()
    );
    println!(
        "{} Telemetry {} at {} baud, reset {} at {} baud",
        "[*]".cyan().bold(),
        config.telemetry.port.white(),
        config.telemetry.baud,
        config.reset.port.white(),
        config.reset.baud
    );
    println!(
        "{} Ending experiments after {} observations or {}s without progress",
        "[*]".cyan().bold(),
        config.watchdog.min_observations,
        config.watchdog.stall_timeout_secs
    );

    terminal::install_interrupt_handler().context("Failed to set Ctrl+C handler")?;

    let summary = if config.build.enabled {
        drive(&config, plan, MakeBuild::new(config.build.clone()), args.no_menu)
    } else {
        drive(&config, plan, SkipBuild, args.no_menu)
    };

    summary.print();
    Ok(())
}

fn drive<B: FirmwareBuild>(
    config: &CampaignConfig,
    plan: Vec<plan::ExperimentRecord>,
    build: B,
    no_menu: bool,
) -> CampaignSummary {
    let reader = TelemetryReader::new(
        config.telemetry.no_match_threshold,
        config.telemetry.read_timeout(),
    );
    let watchdog = Watchdog::new(
        reader.state(),
        config.watchdog.min_observations,
        config.watchdog.stall_timeout(),
        config.watchdog.tick(),
    );

    let (control, input) = Console::stdout();
    let options = DriverOptions {
        tick: config.watchdog.tick(),
        output_dir: config.output.directory.clone(),
        extension: config.output.extension.clone(),
        telemetry: config.telemetry.settings(),
        reset: config.reset.settings(),
    };

    let mut driver = ExperimentDriver::new(plan, build, reader, watchdog, control, options);

    if !no_menu {
        match TerminalKeys::stdin() {
            Ok(keys) => driver = driver.with_menu(MenuInput::start(keys, input, MENU_POLL)),
            Err(e) => log::warn!("Interactive menu disabled: {}", e),
        }
    }

    driver.run()
}

fn handle_plan(cmd: PlanCommands) -> Result<()> {
    match cmd {
        PlanCommands::Check { path, config } => {
            let config = load_config(config.as_deref())?;
            let records = plan::load(&path, config.build.benchmark_kinds)
                .with_context(|| format!("Failed to load plan {}", path.display()))?;

            plan::print_plan(&records);
            println!("{} Plan is valid", "[OK]".green().bold());
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
fn handle_ports(cmd: PortCommands) -> Result<()> {
    match cmd {
        PortCommands::List => serial::port::print_ports(),
    }
}

fn handle_config(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Generate { output } => {
            let rendered = CampaignConfig::default().to_toml();

            if let Some(path) = output {
                std::fs::write(&path, &rendered)?;
                println!(
                    "{} Campaign configuration written to {}",
                    "[OK]".green().bold(),
                    path.display()
                );
            } else {
                println!("{}", rendered);
            }
        }
    }

    Ok(())
}
