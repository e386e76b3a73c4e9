//! Run summaries: what a pipeline run read, dropped and wrote.
//!
//! Summaries are logged at the end of every run and can be appended to a CSV
//! run log.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, info};

use crate::clean::CleaningStats;
use crate::dimensions::DimensionCounts;

/// One row of the run log. Fields stay flat so the record serializes to CSV.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stage: String,
    pub attempts: u32,

    // extract
    pub raw_records: usize,

    // transform
    pub cleaned_records: usize,
    pub dropped_missing: usize,
    pub dropped_duplicate: usize,
    pub dropped_invalid_coords: usize,

    // load
    pub delivery_persons: u64,
    pub locations: u64,
    pub datetimes: u64,
    pub datetimes_skipped: u64,
    pub vehicles: u64,
    pub facts: u64,

    // error tracking
    pub error_phase: Option<String>,
    pub error_message: Option<String>,
}

impl RunSummary {
    pub fn start(stage: &str) -> Self {
        RunSummary {
            started_at: Utc::now(),
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of raw records that survived cleaning, in percent.
    pub fn retention_pct(&self) -> f64 {
        Self::pct(self.cleaned_records, self.raw_records)
    }

    pub fn with_cleaning(mut self, stats: &CleaningStats) -> Self {
        self.cleaned_records = stats.output_rows;
        self.dropped_missing = stats.dropped_missing;
        self.dropped_duplicate = stats.dropped_duplicate;
        self.dropped_invalid_coords = stats.dropped_invalid_coords;
        self
    }

    pub fn with_dimensions(mut self, counts: &DimensionCounts) -> Self {
        self.delivery_persons = counts.delivery_persons;
        self.locations = counts.locations;
        self.datetimes = counts.datetimes;
        self.datetimes_skipped = counts.datetimes_skipped;
        self.vehicles = counts.vehicles;
        self
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// Create a failed-run record with the error's phase and message.
    pub fn from_error(stage: &str, attempts: u32, phase: &str, message: &str) -> Self {
        RunSummary {
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            stage: stage.to_string(),
            attempts,
            error_phase: Some(phase.to_string()),
            error_message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Logs the summary as structured fields, and as JSON at debug level.
pub fn log_summary(summary: &RunSummary) {
    info!(
        stage = %summary.stage,
        attempts = summary.attempts,
        raw_records = summary.raw_records,
        cleaned_records = summary.cleaned_records,
        removed = summary.raw_records.saturating_sub(summary.cleaned_records),
        retention_pct = format!("{:.2}", summary.retention_pct()),
        facts = summary.facts,
        "Final summary"
    );
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        debug!("{}", json);
    }
}

/// Appends a [`RunSummary`] as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &Path, summary: &RunSummary) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending run summary");

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(summary)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    #[test]
    fn test_pct_with_zero_total() {
        assert_eq!(RunSummary::pct(10, 0), 0.0);
    }

    #[test]
    fn test_retention_pct() {
        let mut summary = RunSummary::start("load");
        summary.raw_records = 200;
        summary.cleaned_records = 150;
        assert_eq!(summary.retention_pct(), 75.0);
    }

    #[test]
    fn test_with_cleaning_copies_counters() {
        let stats = CleaningStats {
            input_rows: 5,
            dropped_missing: 1,
            dropped_duplicate: 1,
            dropped_invalid_coords: 1,
            output_rows: 2,
        };
        let summary = RunSummary::start("transform").with_cleaning(&stats);
        assert_eq!(summary.cleaned_records, 2);
        assert_eq!(summary.dropped_invalid_coords, 1);
    }

    #[test]
    fn test_log_summary_does_not_panic() {
        log_summary(&RunSummary::start("extract").finish());
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("delivery_etl_test_runs_header.csv");
        let _ = fs::remove_file(&path);

        let summary = RunSummary::start("load").finish();
        append_record(&path, &summary).unwrap();
        append_record(&path, &RunSummary::from_error("load", 2, "load", "boom")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|l| l.contains("started_at")).count(), 1);
        assert!(lines[2].contains("boom"));

        fs::remove_file(&path).unwrap();
    }
}
