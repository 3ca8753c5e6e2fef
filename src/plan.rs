//! Experiment plan loading
//!
//! A plan is an ordered table of experiments, either exported from the
//! spreadsheet as CSV or written by hand as TOML `[[experiment]]` tables.

use colored::Colorize;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// CSV column headers, matched case-insensitively
const COL_CONFIGURATION: &str = "configuration of cores";
const COL_DATA_ASSIGNMENT: &str = "data assignment";
const COL_DISABLE_CACHE: &str = "disable cache";
const COL_NO_CACHE_MGMT: &str = "no cache management";
const COL_PREFIX: &str = "filename prefix";
/// Optional columns
const COL_DATASIZE: &str = "synbench datasize";
const COL_PMU_CORES: [&str; PMU_CORES] = ["pmu core 0", "pmu core 1", "pmu core 2", "pmu core 3"];

/// Cores with a selectable performance-counter event
const PMU_CORES: usize = 4;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("plan is missing column '{0}'")]
    MissingColumn(&'static str),

    #[error("row {row}: {message}")]
    InvalidRow { row: usize, message: String },

    #[error("plan contains no experiments")]
    Empty,

    #[error("unsupported plan format '{0}' (expected .csv or .toml)")]
    UnsupportedFormat(String),
}

/// One row of the experiment plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExperimentRecord {
    /// One digit per active core, each digit a benchmark id
    pub configuration: String,
    /// Placement of each benchmark's working set, same length as `configuration`
    pub data_assignment: String,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub no_cache_management: bool,
    pub prefix: String,
    /// Working-set size of the synthetic benchmark
    #[serde(default)]
    pub synbench_datasize: Option<u64>,
    /// PMU event per core; `None` keeps the firmware's default
    #[serde(default)]
    pub pmu_core0: Option<String>,
    #[serde(default)]
    pub pmu_core1: Option<String>,
    #[serde(default)]
    pub pmu_core2: Option<String>,
    #[serde(default)]
    pub pmu_core3: Option<String>,
}

impl ExperimentRecord {
    /// File name stem for this experiment's telemetry output
    pub fn output_stem(&self) -> String {
        format!(
            "{}_{}_{}",
            self.prefix, self.configuration, self.data_assignment
        )
    }

    /// Selected PMU events as `(core, event)` pairs
    pub fn pmu_events(&self) -> impl Iterator<Item = (usize, &str)> {
        [&self.pmu_core0, &self.pmu_core1, &self.pmu_core2, &self.pmu_core3]
            .into_iter()
            .enumerate()
            .filter_map(|(core, event)| event.as_deref().map(|e| (core, e)))
    }

    fn validate(&self, row: usize, benchmark_kinds: u8) -> Result<(), PlanError> {
        let invalid = |message: String| PlanError::InvalidRow { row, message };

        if self.configuration.is_empty() {
            return Err(invalid("configuration is empty".into()));
        }
        for c in self.configuration.chars() {
            match c.to_digit(10) {
                Some(d) if d >= 1 && d <= u32::from(benchmark_kinds) => {}
                _ => {
                    return Err(invalid(format!(
                        "configuration '{}' must use digits 1..={}",
                        self.configuration, benchmark_kinds
                    )))
                }
            }
        }

        if !self.data_assignment.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(format!(
                "data assignment '{}' must be a digit string",
                self.data_assignment
            )));
        }
        if self.data_assignment.len() != self.configuration.len() {
            return Err(invalid(format!(
                "data assignment '{}' must have one digit per core ({})",
                self.data_assignment,
                self.configuration.len()
            )));
        }

        if self.synbench_datasize == Some(0) {
            return Err(invalid("synbench datasize must be positive".into()));
        }
        for (core, event) in self.pmu_events() {
            if event.is_empty() || event.contains(char::is_whitespace) {
                return Err(invalid(format!(
                    "pmu core {} event '{}' must be a single word",
                    core, event
                )));
            }
        }

        if self.prefix.is_empty() {
            return Err(invalid("filename prefix is empty".into()));
        }
        if self.prefix.contains(['/', '\\']) {
            return Err(invalid(format!(
                "filename prefix '{}' must not contain a path separator",
                self.prefix
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TomlPlan {
    #[serde(default)]
    experiment: Vec<ExperimentRecord>,
}

/// Load a plan, picking the format from the file extension
pub fn load(path: &Path, benchmark_kinds: u8) -> Result<Vec<ExperimentRecord>, PlanError> {
    let content = fs::read_to_string(path).map_err(|source| PlanError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => parse_csv(&content, benchmark_kinds),
        "toml" => parse_toml(&content, benchmark_kinds),
        other => Err(PlanError::UnsupportedFormat(other.to_string())),
    }
}

pub fn parse_toml(content: &str, benchmark_kinds: u8) -> Result<Vec<ExperimentRecord>, PlanError> {
    let plan: TomlPlan = toml::from_str(content)?;
    finish(
        plan.experiment.into_iter().enumerate().map(|(i, r)| (i + 1, r)).collect(),
        benchmark_kinds,
    )
}

pub fn parse_csv(content: &str, benchmark_kinds: u8) -> Result<Vec<ExperimentRecord>, PlanError> {
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let header: Vec<String> = match lines.next() {
        Some((_, line)) => split_row(line).iter().map(|h| h.to_lowercase()).collect(),
        None => return Err(PlanError::Empty),
    };

    let column = |name: &'static str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or(PlanError::MissingColumn(name))
    };
    let configuration = column(COL_CONFIGURATION)?;
    let data_assignment = column(COL_DATA_ASSIGNMENT)?;
    let disable_cache = column(COL_DISABLE_CACHE)?;
    let no_cache_mgmt = column(COL_NO_CACHE_MGMT)?;
    let prefix = column(COL_PREFIX)?;
    let optional = |name: &str| header.iter().position(|h| h == name);
    let datasize = optional(COL_DATASIZE);
    let pmu = COL_PMU_CORES.map(optional);

    let mut records = Vec::new();
    for (index, line) in lines {
        let row = index + 1;
        let cells = split_row(line);
        let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or("");
        // blank optional cells mean "not set"
        let filled = |i: Option<usize>| {
            i.map(cell)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let synbench_datasize: Option<u64> = match filled(datasize) {
            Some(v) => Some(v.parse().map_err(|_| PlanError::InvalidRow {
                row,
                message: format!("synbench datasize '{}' is not a number", v),
            })?),
            None => None,
        };

        let record = ExperimentRecord {
            configuration: cell(configuration).to_string(),
            data_assignment: cell(data_assignment).to_string(),
            disable_cache: parse_flag(cell(disable_cache), row)?,
            no_cache_management: parse_flag(cell(no_cache_mgmt), row)?,
            prefix: cell(prefix).to_string(),
            synbench_datasize,
            pmu_core0: filled(pmu[0]),
            pmu_core1: filled(pmu[1]),
            pmu_core2: filled(pmu[2]),
            pmu_core3: filled(pmu[3]),
        };
        records.push((row, record));
    }

    finish(records, benchmark_kinds)
}

fn finish(
    rows: Vec<(usize, ExperimentRecord)>,
    benchmark_kinds: u8,
) -> Result<Vec<ExperimentRecord>, PlanError> {
    if rows.is_empty() {
        return Err(PlanError::Empty);
    }
    rows.into_iter()
        .map(|(row, record)| record.validate(row, benchmark_kinds).map(|_| record))
        .collect()
}

/// Split a CSV row and strip the quoting the spreadsheet export adds.
/// Digit strings are stored with surrounding single quotes so they survive
/// as text; those are removed too.
fn split_row(line: &str) -> Vec<String> {
    line.split(',')
        .map(|cell| {
            cell.trim()
                .trim_matches('"')
                .trim_matches('\'')
                .trim()
                .to_string()
        })
        .collect()
}

fn parse_flag(value: &str, row: usize) -> Result<bool, PlanError> {
    match value.to_lowercase().as_str() {
        "" | "0" | "false" | "no" | "n" => Ok(false),
        "1" | "true" | "yes" | "y" => Ok(true),
        other => Err(PlanError::InvalidRow {
            row,
            message: format!("'{}' is not a boolean", other),
        }),
    }
}

/// Print the parsed plan
pub fn print_plan(records: &[ExperimentRecord]) {
    println!("{}", "=".repeat(70));
    println!("{}", "Experiment Plan".cyan().bold());
    println!("{}", "=".repeat(70));

    for (i, record) in records.iter().enumerate() {
        println!(
            "\n  {} {}",
            format!("#{}", i + 1).white().bold(),
            record.prefix.cyan()
        );
        println!("    Configuration:   {}", record.configuration);
        println!("    Data assignment: {}", record.data_assignment);
        if record.disable_cache {
            println!("    {}", "cache disabled".yellow());
        }
        if record.no_cache_management {
            println!("    {}", "no cache management".yellow());
        }
        if let Some(size) = record.synbench_datasize {
            println!("    Synbench datasize: {}", size);
        }
        for (core, event) in record.pmu_events() {
            println!("    PMU core {}:      {}", core, event);
        }
    }

    println!("\n{}", "=".repeat(70));
    println!("{} experiments", records.len());
}
