//! Experiment driver
//!
//! The main control loop: for each plan record it clears the telemetry
//! state, rebuilds the firmware and then waits, one tick at a time, until
//! the watchdog signals that the experiment is over or the operator
//! intervenes.

use crate::config::PortSettings;
use crate::console::{ConsoleHandle, Tag};
use crate::firmware::FirmwareBuild;
use crate::menu::{MenuCommand, MenuInput};
use crate::plan::ExperimentRecord;
use crate::telemetry::TelemetryReader;
use crate::watchdog::Watchdog;
use colored::Colorize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Settings the driver needs besides its collaborators
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub tick: Duration,
    pub output_dir: PathBuf,
    pub extension: String,
    pub telemetry: PortSettings,
    pub reset: PortSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Advance,
    Quit,
}

/// Totals reported when the campaign ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub planned: usize,
    pub attempted: usize,
    pub build_failures: usize,
    pub by_threshold: u32,
    pub by_timeout: u32,
    pub by_operator: u32,
    pub quit: bool,
}

impl CampaignSummary {
    pub fn print(&self) {
        println!("\n{}", "=".repeat(70).dimmed());
        println!("{}", "--- Campaign Summary ---".cyan().bold());
        println!("Experiments attempted: {}/{}", self.attempted, self.planned);
        println!(
            "Build failures: {}",
            if self.build_failures > 0 {
                self.build_failures.to_string().red().bold().to_string()
            } else {
                self.build_failures.to_string().green().to_string()
            }
        );
        println!("Completed with enough observations: {}", self.by_threshold);
        println!("Ended by stall timeout: {}", self.by_timeout);
        println!("Advanced by operator: {}", self.by_operator);
        if self.quit {
            println!("{}", "Stopped by operator before the end of the plan".yellow());
        }
        println!("{}", "=".repeat(70).dimmed());
    }
}

pub struct ExperimentDriver<B, W: Write + Send> {
    plan: Vec<ExperimentRecord>,
    build: B,
    reader: TelemetryReader,
    watchdog: Watchdog,
    menu: Option<MenuInput>,
    console: ConsoleHandle<W>,
    options: DriverOptions,
    interrupted: fn() -> bool,
}

impl<B: FirmwareBuild, W: Write + Send> ExperimentDriver<B, W> {
    pub fn new(
        plan: Vec<ExperimentRecord>,
        build: B,
        reader: TelemetryReader,
        watchdog: Watchdog,
        console: ConsoleHandle<W>,
        options: DriverOptions,
    ) -> Self {
        Self {
            plan,
            build,
            reader,
            watchdog,
            menu: None,
            console,
            options,
            interrupted: crate::terminal::interrupted,
        }
    }

    pub fn with_menu(mut self, menu: MenuInput) -> Self {
        self.menu = Some(menu);
        self
    }

    /// Replace the Ctrl+C check
    #[cfg(test)]
    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Run the whole plan, then stop every background thread
    pub fn run(mut self) -> CampaignSummary {
        let plan = std::mem::take(&mut self.plan);
        let mut summary = CampaignSummary {
            planned: plan.len(),
            ..Default::default()
        };

        self.connect(false);
        self.watchdog.start();

        for (index, record) in plan.iter().enumerate() {
            summary.attempted += 1;
            if self.run_record(index, plan.len(), record, &mut summary) == Outcome::Quit {
                summary.quit = true;
                break;
            }
        }

        if !summary.quit {
            self.console.line(Tag::Ok, "All experiments done");
        }

        let counts = self.watchdog.counts();
        summary.by_threshold = counts.threshold();
        summary.by_timeout = counts.timeout();
        summary.by_operator = counts.manual();

        self.shutdown();
        summary
    }

    fn run_record(
        &mut self,
        index: usize,
        total: usize,
        record: &ExperimentRecord,
        summary: &mut CampaignSummary,
    ) -> Outcome {
        self.reader.clear();
        self.console.line(
            Tag::Info,
            &format!(
                "Experiment {}/{}: {} (cores {}, data {})",
                index + 1,
                total,
                record.prefix,
                record.configuration,
                record.data_assignment
            ),
        );

        let output = self.output_path(record);
        self.set_output(&output);

        // a long build must not count as a stall
        self.watchdog.pause();
        let outcome = self.build.build(record);
        if outcome.success {
            // the board still runs the previous image until it is reset
            self.watchdog.restart_target();
            self.console.line(Tag::Ok, "Firmware built, target restarted");
        } else {
            summary.build_failures += 1;
            self.console.line(
                Tag::Error,
                "Firmware build failed, waiting for timeout or operator",
            );
        }
        self.watchdog.resume();

        loop {
            if (self.interrupted)() {
                self.console.line(Tag::Warn, "Interrupted");
                return Outcome::Quit;
            }

            if self.watchdog.signal().take() {
                self.console.line(Tag::Ok, "Target reset, moving to next experiment");
                return Outcome::Advance;
            }

            let command = self.menu.as_ref().and_then(MenuInput::take);
            if let Some(command) = command {
                if self.handle(command) == Some(Outcome::Quit) {
                    return Outcome::Quit;
                }
            }

            self.render_status(index, total, record);
            thread::sleep(self.options.tick);
        }
    }

    fn handle(&mut self, command: MenuCommand) -> Option<Outcome> {
        match command {
            MenuCommand::Quit => {
                self.console.line(Tag::Warn, "Quitting");
                return Some(Outcome::Quit);
            }
            MenuCommand::SetOutputFile(path) => self.set_output(&path),
            MenuCommand::SetTelemetryPort(port) => {
                self.options.telemetry.port = port;
                self.console
                    .line(Tag::Info, "Telemetry port set, press 'c' to connect");
            }
            MenuCommand::SetResetPort(port) => {
                self.options.reset.port = port;
                self.console.line(Tag::Info, "Reset port set, press 'c' to connect");
            }
            MenuCommand::Connect => self.connect(true),
            MenuCommand::ManualReset => self.watchdog.restart_target(),
            // the raised signal is consumed on the next pass of the loop
            MenuCommand::NextExperiment => self.watchdog.manual_reset(),
        }
        None
    }

    /// Open the links. Without `force` only missing connections are opened.
    fn connect(&mut self, force: bool) {
        if force || !self.reader.is_connected() {
            let settings = self.options.telemetry.clone();
            match self.reader.start(&settings) {
                Ok(()) => self
                    .console
                    .line(Tag::Ok, &format!("Telemetry connected: {}", settings.port)),
                Err(e) => self
                    .console
                    .line(Tag::Error, &format!("Telemetry port {}: {}", settings.port, e)),
            }
        }

        if force || !self.watchdog.is_connected() {
            let settings = self.options.reset.clone();
            match self.watchdog.connect(&settings) {
                Ok(()) => self
                    .console
                    .line(Tag::Ok, &format!("Reset line connected: {}", settings.port)),
                Err(e) => self.console.line(
                    Tag::Warn,
                    &format!(
                        "Reset port {}: {} (experiments will end by timeout only)",
                        settings.port, e
                    ),
                ),
            }
        }
    }

    fn output_path(&self, record: &ExperimentRecord) -> PathBuf {
        self.options
            .output_dir
            .join(format!("{}.{}", record.output_stem(), self.options.extension))
    }

    fn set_output(&mut self, path: &Path) {
        if let Err(e) = self.reader.set_output(path) {
            self.console.line(
                Tag::Error,
                &format!("Cannot open {}: {}", path.display(), e),
            );
        }
    }

    fn render_status(&mut self, index: usize, total: usize, record: &ExperimentRecord) {
        let link = |up: bool| if up { "up" } else { "down" };
        let status = format!(
            "exp {}/{} {} | iteration {} ({}) | idle {}s | telemetry {} | reset {}",
            index + 1,
            total,
            record.prefix,
            self.reader.get_iteration(),
            if self.reader.get_valid() { "valid" } else { "no sync" },
            self.watchdog.idle().as_secs(),
            link(self.reader.is_connected()),
            link(self.watchdog.is_connected()),
        );
        self.console.status(&status);
    }

    fn shutdown(&mut self) {
        if let Some(mut menu) = self.menu.take() {
            menu.stop();
        }
        self.watchdog.stop();
        self.reader.stop();
        log::info!("All threads stopped");
    }
}
