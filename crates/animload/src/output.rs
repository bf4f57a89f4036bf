//! Table output of the command line.

use std::path::PathBuf;
use std::time::Duration;

use animload_service::caching::CleanupStats;
use animload_service::types::{Animation, AnimationKind};
use animload_service::{DataSource, DecodeError, LoadError};
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Cell, Row, Table, cell, row};

/// The parts of a delivered animation shown in the output.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub kind: AnimationKind,
    pub size: usize,
    pub dimensions: Option<(u32, u32)>,
    pub duration: Option<Duration>,
}

impl Summary {
    pub fn new(animation: &Animation) -> Self {
        Self {
            kind: animation.kind(),
            size: animation.data().len(),
            dimensions: animation.dimensions(),
            duration: animation.duration(),
        }
    }
}

/// The outcome of loading one source once.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt: usize,
    pub source: String,
    pub outcome: Result<(Summary, DataSource, bool), LoadError>,
}

/// The outcome of probing one file.
#[derive(Debug)]
pub struct Probe {
    pub path: PathBuf,
    pub outcome: Result<Animation, DecodeError>,
}

fn format_dimensions(dimensions: Option<(u32, u32)>) -> String {
    match dimensions {
        Some((width, height)) => format!("{width}x{height}"),
        None => "-".into(),
    }
}

fn format_duration(duration: Option<Duration>) -> String {
    match duration {
        // whole milliseconds, humantime would print nanoseconds otherwise
        Some(duration) => {
            let millis = Duration::from_millis(duration.as_millis() as u64);
            humantime::format_duration(millis).to_string()
        }
        None => "-".into(),
    }
}

fn format_data_source(data_source: DataSource, from_alternate_key: bool) -> String {
    if from_alternate_key {
        format!("{data_source} (fallback)")
    } else {
        data_source.to_string()
    }
}

fn summary_cells(summary: &Summary) -> [String; 4] {
    [
        summary.kind.to_string(),
        summary.size.to_string(),
        format_dimensions(summary.dimensions),
        format_duration(summary.duration),
    ]
}

fn attempt_row(attempt: &Attempt) -> Row {
    let mut row = row![r->attempt.attempt, attempt.source];
    match &attempt.outcome {
        Ok((summary, data_source, from_alternate_key)) => {
            for text in summary_cells(summary) {
                row.add_cell(Cell::new(&text));
            }
            row.add_cell(Cell::new(&format_data_source(
                *data_source,
                *from_alternate_key,
            )));
        }
        Err(error) => row.add_cell(cell!(Fr->error).with_hspan(5)),
    }
    row
}

pub fn print_attempts(attempts: &[Attempt]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "#", "Source", "Kind", "Size", "Dimensions", "Duration", "Data Source"]);
    for attempt in attempts {
        table.add_row(attempt_row(attempt));
    }
    table.printstd();
}

pub fn print_probes(probes: &[Probe]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "File", "Kind", "Size", "Dimensions", "Duration"]);
    for probe in probes {
        let mut row = row![probe.path.display()];
        match &probe.outcome {
            Ok(animation) => {
                for text in summary_cells(&Summary::new(animation)) {
                    row.add_cell(Cell::new(&text));
                }
            }
            Err(error) => row.add_cell(cell!(Fr->error).with_hspan(4)),
        }
        table.add_row(row);
    }
    table.printstd();
}

/// Prints the probed headers as a JSON array, files that failed to probe are skipped.
pub fn print_probes_json(probes: &[Probe]) -> anyhow::Result<()> {
    let animations: Vec<_> = probes
        .iter()
        .filter_map(|probe| probe.outcome.as_ref().ok())
        .collect();
    println!("{}", serde_json::to_string_pretty(&animations)?);
    Ok(())
}

pub fn print_cleanup(stats: &CleanupStats, dry_run: bool) {
    let removed = if dry_run { "Would remove" } else { "Removed" };

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "", "Directories", "Files", "Bytes"]);
    table.add_row(row![
        b->removed,
        r->stats.removed_dirs,
        r->stats.removed_files,
        r->stats.removed_bytes
    ]);
    table.add_row(row![
        b->"Retained",
        r->stats.retained_dirs,
        r->stats.retained_files,
        r->stats.retained_bytes
    ]);
    table.printstd();
}
