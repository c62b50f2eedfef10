//! Run summary and results file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::RunDefaults;
use crate::error::Result;
use crate::failure::FailureHistogram;
use crate::machine::UploadOutcome;
use crate::persist::write_json;
use crate::types::CustomerCounters;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerTally {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Already completed before this run.
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceTally {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Completed (or failed, without `--retry-failed`) before this run.
    pub skipped: u64,
    /// Stopped by cancellation or the upload limit.
    pub interrupted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTally {
    pub total: u64,
    pub succeeded: u64,
    pub already_migrated: u64,
    pub failed: u64,
    /// Not attempted because of an indexing service outage.
    pub skipped: u64,
}

/// Everything one orchestrator run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub instance_id: Option<u32>,
    pub worker_id: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub customers: CustomerTally,
    pub spaces: SpaceTally,
    pub uploads: UploadTally,
    pub failures: FailureHistogram,
    /// Non-fatal classifications on successful uploads.
    pub advisories: FailureHistogram,
    pub counters: CustomerCounters,
    pub cancelled: bool,
    pub limit_reached: bool,
    pub outcomes: Vec<UploadOutcome>,
}

impl RunReport {
    pub fn new(instance_id: Option<u32>, worker_id: impl Into<String>, dry_run: bool) -> Self {
        Self {
            instance_id,
            worker_id: worker_id.into(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            customers: CustomerTally::default(),
            spaces: SpaceTally::default(),
            uploads: UploadTally::default(),
            failures: FailureHistogram::new(),
            advisories: FailureHistogram::new(),
            counters: CustomerCounters::default(),
            cancelled: false,
            limit_reached: false,
            outcomes: Vec::new(),
        }
    }

    /// Fold one upload outcome into the tallies and counters.
    pub fn record(&mut self, outcome: UploadOutcome) {
        self.uploads.total += 1;
        if outcome.success {
            self.uploads.succeeded += 1;
            if outcome.already_migrated {
                self.uploads.already_migrated += 1;
            }
        } else if outcome.skipped {
            self.uploads.skipped += 1;
        } else {
            self.uploads.failed += 1;
        }

        if let Some(reason) = outcome.reason {
            self.failures.record(reason);
        }
        if let Some(advisory) = outcome.advisory {
            self.advisories.record(advisory);
        }
        self.counters.absorb(&outcome.counters);
        self.outcomes.push(outcome);
    }

    /// Stamp `finished_at`.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Any failed upload or space.
    pub fn has_failures(&self) -> bool {
        self.uploads.failed > 0 || self.spaces.failed > 0
    }

    /// Failed and skipped outcomes grouped by space.
    pub fn failures_by_space(&self) -> BTreeMap<&str, Vec<&UploadOutcome>> {
        let mut grouped: BTreeMap<&str, Vec<&UploadOutcome>> = BTreeMap::new();
        for outcome in self.outcomes.iter().filter(|o| !o.success) {
            grouped.entry(outcome.space.as_str()).or_default().push(outcome);
        }
        grouped
    }

    /// Human-readable summary printed at the end of a run.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let total = self.uploads.total;

        let _ = writeln!(out, "Migration summary");
        if let Some(instance) = self.instance_id {
            let _ = writeln!(out, "  instance:         {}", instance);
        }
        if self.dry_run {
            let _ = writeln!(out, "  mode:             dry run (analysis only)");
        }
        let _ = writeln!(
            out,
            "  customers:        {} processed, {} completed, {} failed, {} already done",
            self.customers.processed,
            self.customers.completed,
            self.customers.failed,
            self.customers.skipped
        );
        let _ = writeln!(
            out,
            "  spaces:           {} processed, {} completed, {} failed, {} skipped, {} interrupted",
            self.spaces.processed,
            self.spaces.completed,
            self.spaces.failed,
            self.spaces.skipped,
            self.spaces.interrupted
        );
        let _ = writeln!(out, "  uploads:          {}", total);
        let _ = writeln!(
            out,
            "    succeeded:      {} ({:.1}%)",
            self.uploads.succeeded,
            percent(self.uploads.succeeded, total)
        );
        let _ = writeln!(
            out,
            "    already done:   {} ({:.1}%)",
            self.uploads.already_migrated,
            percent(self.uploads.already_migrated, total)
        );
        let _ = writeln!(
            out,
            "    failed:         {} ({:.1}%)",
            self.uploads.failed,
            percent(self.uploads.failed, total)
        );
        let _ = writeln!(
            out,
            "    skipped:        {} ({:.1}%)",
            self.uploads.skipped,
            percent(self.uploads.skipped, total)
        );
        let _ = writeln!(
            out,
            "  indexes generated: {}, location claims: {}, gateway grants: {}, gateway skips: {}",
            self.counters.indexes_generated,
            self.counters.location_claims_published,
            self.counters.gateway_grants,
            self.counters.gateway_skips
        );

        let grouped = self.failures_by_space();
        if !grouped.is_empty() {
            let _ = writeln!(out, "\nFailures by space");
            for (space, outcomes) in &grouped {
                let _ = writeln!(out, "  {} ({} uploads)", space, outcomes.len());
                for outcome in outcomes {
                    let _ = writeln!(
                        out,
                        "    {} {} at {}: {}",
                        outcome.root,
                        outcome.reason.map(|r| r.as_str()).unwrap_or("UNKNOWN_ERROR"),
                        outcome
                            .failed_step
                            .map(|s| s.as_str())
                            .unwrap_or("-"),
                        outcome.error.as_deref().unwrap_or("")
                    );
                }
            }
        }

        render_histogram(&mut out, "Failure reasons", &self.failures);
        render_histogram(&mut out, "Advisories", &self.advisories);

        if self.cancelled {
            let _ = writeln!(out, "\nRun was cancelled; rerun to resume.");
        }
        if self.limit_reached {
            let _ = writeln!(out, "\nUpload limit reached; rerun to continue.");
        }
        out
    }

    /// Write the full report to `migration-results-<timestamp>.json` in `dir`.
    pub fn write_results(&self, dir: &Path) -> Result<PathBuf> {
        let stamp = self
            .finished_at
            .unwrap_or_else(Utc::now)
            .format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("{}-{}.json", RunDefaults::RESULTS_FILE_PREFIX, stamp));
        write_json(&path, self)?;
        info!("Wrote {} results to {}", self.outcomes.len(), path.display());
        Ok(path)
    }
}

fn render_histogram(out: &mut String, title: &str, histogram: &FailureHistogram) {
    if histogram.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{}", title);
    for (reason, count) in histogram.ranked() {
        let _ = writeln!(
            out,
            "  {:<26} {:>8} ({:.1}%)",
            reason.as_str(),
            count,
            histogram.percentage(reason)
        );
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
