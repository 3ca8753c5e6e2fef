//! Firmware build step
//!
//! Regenerates the benchmark configuration header for an experiment and
//! rebuilds and installs the firmware. The build is treated as opaque:
//! all that matters is whether it succeeded and what it printed.

use crate::config::BuildConfig;
use crate::plan::ExperimentRecord;
use std::fs::File;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    /// Captured stdout and stderr of every step, in order
    pub output: String,
}

impl BuildOutcome {
    fn failed(output: String) -> Self {
        Self {
            success: false,
            output,
        }
    }
}

pub trait FirmwareBuild {
    fn build(&mut self, record: &ExperimentRecord) -> BuildOutcome;
}

/// Always succeeds without doing anything
#[derive(Debug, Default)]
pub struct SkipBuild;

impl FirmwareBuild for SkipBuild {
    fn build(&mut self, record: &ExperimentRecord) -> BuildOutcome {
        log::info!("Build skipped for {}", record.output_stem());
        BuildOutcome {
            success: true,
            output: String::new(),
        }
    }
}

/// `make clean`, `m4` into the config header, `make install`
#[derive(Debug, Clone)]
pub struct MakeBuild {
    config: BuildConfig,
}

impl MakeBuild {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    /// Arguments for the m4 step
    pub fn m4_args(&self, record: &ExperimentRecord) -> Vec<String> {
        let mut args = vec![
            format!("-Dconfig={}", record.configuration),
            format!("-Ddata={}", record.data_assignment),
            format!("-Dexp_label={}", record.prefix),
        ];
        args.extend(
            record
                .pmu_events()
                .map(|(core, event)| format!("-Dpmu_core{}={}", core, event)),
        );
        args.push(self.config.template.clone());
        args
    }

    /// Arguments for the install step
    pub fn install_args(&self, record: &ExperimentRecord) -> Vec<String> {
        let mut args = Vec::new();
        if record.disable_cache {
            args.push("DISABLE_CACHE=-DDISABLE_CACHE".to_string());
        }
        if record.no_cache_management {
            args.push("NO_CACHE_MGMT=-DNO_CACHE_MGMT".to_string());
        }
        if let Some(size) = record.synbench_datasize {
            args.push(format!("SYNBENCH_DATASIZE=-DSYNBENCH_DATASIZE={}", size));
        }
        args.push("install".to_string());
        args
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.config.working_dir)
            .env("BENCHMARK_CONFIG", "-DBENCHMARK_CONFIG_M4")
            .stdin(Stdio::null());
        cmd
    }

    /// Run a step, appending its output. Returns false if it failed.
    fn run_step(&self, mut cmd: Command, label: &str, transcript: &mut String) -> bool {
        log::info!("Build: {}", label);
        match cmd.output() {
            Ok(out) => {
                transcript.push_str(&String::from_utf8_lossy(&out.stdout));
                transcript.push_str(&String::from_utf8_lossy(&out.stderr));
                if !out.status.success() {
                    log::warn!("Build step '{}' failed with {}", label, out.status);
                }
                out.status.success()
            }
            Err(e) => {
                log::warn!("Build step '{}' could not start: {}", label, e);
                transcript.push_str(&format!("{}: {}\n", label, e));
                false
            }
        }
    }
}

impl FirmwareBuild for MakeBuild {
    fn build(&mut self, record: &ExperimentRecord) -> BuildOutcome {
        let mut transcript = String::new();

        let clean = self.command(&self.config.make, &["clean".to_string()]);
        if !self.run_step(clean, "make clean", &mut transcript) {
            return BuildOutcome::failed(transcript);
        }

        let header_path = self.config.working_dir.join(&self.config.header);
        let header = match File::create(&header_path) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("Cannot write {}: {}", header_path.display(), e);
                transcript.push_str(&format!("{}: {}\n", header_path.display(), e));
                return BuildOutcome::failed(transcript);
            }
        };
        let mut m4 = self.command(&self.config.m4, &self.m4_args(record));
        m4.stdout(header);
        if !self.run_step(m4, "m4 config header", &mut transcript) {
            return BuildOutcome::failed(transcript);
        }

        let install = self.command(&self.config.make, &self.install_args(record));
        let success = self.run_step(install, "make install", &mut transcript);

        for line in transcript.lines() {
            log::debug!("{}", line);
        }
        BuildOutcome {
            success,
            output: transcript,
        }
    }
}
