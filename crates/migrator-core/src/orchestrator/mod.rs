//! Per-instance migration driver.
//!
//! Loads the instance's customers, walks each customer's spaces, and drives
//! every upload of a space through the [`MigrationStepMachine`] one at a time.
//! Space progress is checkpointed every `checkpoint_every` uploads and marked
//! terminal when the space's upload listing ends; the customer row is rolled up
//! once all its spaces have been visited.
//!
//! Resume rules:
//! - a `completed` space is skipped before any upload is listed
//! - a `failed` space is skipped unless `retry_failed` is set, in which case it
//!   restarts from scratch
//! - a `pending` / `in-progress` space continues after `lastProcessedUpload`
//!
//! Dry runs and single-step test runs leave the progress store untouched: a
//! space only becomes `completed` after every step has run on its uploads.

mod report;

pub use report::{CustomerTally, RunReport, SpaceTally, UploadTally};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::collaborators::{UploadPage, UploadSource};
use crate::config::MigrationSettings;
use crate::error::{MigrationError, Result};
use crate::failure::FailureHistogram;
use crate::machine::{MigrationStepMachine, StepMode};
use crate::owner_cache::OwnerCache;
use crate::progress::{CustomerTotals, ProgressStore};
use crate::retry::{retry_transient, RetryConfig};
use crate::types::{CustomerAssignment, CustomerCounters, ProgressStatus, UploadRecord};

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub worker_id: String,
    /// Uploads between space checkpoints.
    pub checkpoint_every: u64,
    /// Pause between uploads.
    pub upload_delay: Duration,
    pub page_size: usize,
    /// Stop after this many uploads have been migrated.
    pub limit: Option<u64>,
    /// Reprocess spaces whose last run failed.
    pub retry_failed: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&MigrationSettings::default())
    }
}

impl RunOptions {
    /// Run options from settings, with a fresh random worker id.
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            checkpoint_every: settings.checkpoint_every.max(1),
            upload_delay: settings.upload_delay(),
            page_size: settings.page_size.max(1),
            limit: None,
            retry_failed: false,
        }
    }
}

/// How a space's upload loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRunState {
    Completed,
    Failed,
    /// Skipped by the resume rules; no uploads were listed.
    Skipped,
    /// Stopped early by cancellation or the upload limit.
    Interrupted,
}

/// Why a run stopped before finishing its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Limit,
}

/// Drives assigned customers through migration.
pub struct Orchestrator {
    source: Arc<dyn UploadSource>,
    machine: MigrationStepMachine,
    store: Arc<dyn ProgressStore>,
    owners: Option<Arc<OwnerCache>>,
    options: RunOptions,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn UploadSource>,
        machine: MigrationStepMachine,
        store: Arc<dyn ProgressStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            machine,
            store,
            owners: None,
            options,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Ownership lookups for ad-hoc space runs.
    pub fn with_owner_cache(mut self, owners: Arc<OwnerCache>) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Stop between uploads once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Retry policy for upload listing.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn dry_run(&self) -> bool {
        self.machine.options().dry_run
    }

    fn new_report(&self, instance_id: Option<u32>) -> RunReport {
        if let StepMode::Only(step) = self.machine.options().mode {
            info!("Test mode ({}): progress will not be recorded", step);
        }
        RunReport::new(instance_id, &self.options.worker_id, self.dry_run())
    }

    /// Whether this run may write progress rows.
    fn records_progress(&self) -> bool {
        let options = self.machine.options();
        !options.dry_run && options.mode == StepMode::Full
    }

    /// Run every customer the planner assigned to `instance_id`.
    pub async fn run_instance(&self, instance_id: u32) -> Result<RunReport> {
        let assignments = self.store.assignments_for_instance(instance_id)?;
        info!(
            "Instance {} has {} assigned customers",
            instance_id,
            assignments.len()
        );
        self.run_assignments(Some(instance_id), &assignments).await
    }

    /// Run an explicit list of customer assignments.
    pub async fn run_assignments(
        &self,
        instance_id: Option<u32>,
        assignments: &[CustomerAssignment],
    ) -> Result<RunReport> {
        let mut report = self.new_report(instance_id);

        for assignment in assignments {
            if let Some(stop) = self.stop_reason(&report) {
                self.note_stop(&mut report, stop);
                break;
            }
            if let Some(stop) = self.run_customer(assignment, instance_id, &mut report).await? {
                self.note_stop(&mut report, stop);
                break;
            }
        }

        report.finish();
        Ok(report)
    }

    /// Migrate one space outside any planner assignment.
    ///
    /// The owning customer is resolved through the ownership cache. No customer
    /// roll-up is written.
    pub async fn run_space(&self, space: &str) -> Result<RunReport> {
        let owners = self.owners.as_ref().ok_or_else(|| MigrationError::Config {
            message: "ad-hoc space runs need an ownership index".to_string(),
        })?;
        let customer = owners
            .customer_of(space)
            .await?
            .ok_or_else(|| MigrationError::NotFound {
                kind: "space owner",
                id: space.to_string(),
            })?;
        info!("Migrating space {} of customer {}", space, customer);

        let mut report = self.new_report(None);
        let mut histogram = FailureHistogram::new();
        let (state, stop) = self
            .run_space_uploads(&customer, space, None, &mut report, &mut histogram)
            .await?;
        tally_space(&mut report, state);
        if let Some(stop) = stop {
            self.note_stop(&mut report, stop);
        }
        report.finish();
        Ok(report)
    }

    async fn run_customer(
        &self,
        assignment: &CustomerAssignment,
        instance_id: Option<u32>,
        report: &mut RunReport,
    ) -> Result<Option<StopReason>> {
        let customer = assignment.customer.as_str();
        let existing = self.store.get_customer_progress(customer)?;
        if existing.as_ref().map(|c| c.status) == Some(ProgressStatus::Completed) {
            debug!("Customer {} already completed", customer);
            report.customers.skipped += 1;
            return Ok(None);
        }

        info!(
            "Customer {}: {} spaces, ~{} uploads",
            customer,
            assignment.spaces.len(),
            assignment.upload_count
        );
        report.customers.processed += 1;
        if self.records_progress() {
            if existing.is_none() {
                // Assignment came from a file rather than this store
                self.store.save_assignment(assignment, None)?;
            }
            self.store.mark_customer_in_progress(customer)?;
        }

        let before = report.counters;
        for space in &assignment.spaces {
            if let Some(stop) = self.stop_reason(report) {
                return Ok(Some(stop));
            }
            let mut histogram = FailureHistogram::new();
            let (state, stop) = self
                .run_space_uploads(customer, space, instance_id, report, &mut histogram)
                .await?;
            tally_space(report, state);
            if stop.is_some() {
                return Ok(stop);
            }
        }

        if !self.records_progress() {
            return Ok(None);
        }

        let mut counters = existing.map(|c| c.counters).unwrap_or_default();
        counters.absorb(&counter_delta(&before, &report.counters));
        self.roll_up_customer(assignment, counters, report)?;
        Ok(None)
    }

    /// Write the customer's terminal status from its space rows.
    fn roll_up_customer(
        &self,
        assignment: &CustomerAssignment,
        counters: CustomerCounters,
        report: &mut RunReport,
    ) -> Result<()> {
        let customer = assignment.customer.as_str();
        let assigned: HashSet<&str> = assignment.spaces.iter().map(String::as_str).collect();
        let rows: Vec<_> = self
            .store
            .list_space_progress(customer)?
            .into_iter()
            .filter(|row| assigned.contains(row.space.as_str()))
            .collect();

        let mut totals = CustomerTotals {
            total_spaces: assignment.spaces.len() as u64,
            counters,
            ..Default::default()
        };
        let mut histogram = FailureHistogram::new();
        for row in &rows {
            totals.total_uploads += row.total_uploads;
            totals.completed_uploads += row.completed_uploads;
            match row.status {
                ProgressStatus::Completed => totals.completed_spaces += 1,
                ProgressStatus::Failed => {
                    if let Some(hist) = row.error.as_deref().and_then(FailureHistogram::from_json) {
                        histogram.merge(&hist);
                    }
                }
                _ => {}
            }
        }

        if totals.completed_spaces == totals.total_spaces {
            self.store.mark_customer_completed(customer, &totals)?;
            report.customers.completed += 1;
            info!("Customer {} completed", customer);
        } else {
            let error = if histogram.is_empty() {
                format!(
                    "{} of {} spaces incomplete",
                    totals.total_spaces - totals.completed_spaces,
                    totals.total_spaces
                )
            } else {
                histogram.to_json()
            };
            self.store.mark_customer_failed(customer, &totals, &error)?;
            report.customers.failed += 1;
            warn!("Customer {} failed: {}", customer, error);
        }
        Ok(())
    }

    /// Process one space. Returns how it ended and whether the run must stop.
    async fn run_space_uploads(
        &self,
        customer: &str,
        space: &str,
        instance_id: Option<u32>,
        report: &mut RunReport,
        histogram: &mut FailureHistogram,
    ) -> Result<(SpaceRunState, Option<StopReason>)> {
        let record = self.records_progress();
        let existing = self.store.get_space_progress(customer, space)?;

        let mut resume_after: Option<String> = None;
        let mut completed: u64 = 0;
        match existing.as_ref().map(|p| p.status) {
            Some(ProgressStatus::Completed) => {
                debug!("Space {} already completed", space);
                return Ok((SpaceRunState::Skipped, None));
            }
            Some(ProgressStatus::Failed) if !self.options.retry_failed => {
                debug!("Space {} failed previously; not retrying", space);
                return Ok((SpaceRunState::Skipped, None));
            }
            Some(ProgressStatus::Failed) => {
                if record {
                    self.store.mark_space_in_progress(
                        customer,
                        space,
                        instance_id,
                        &self.options.worker_id,
                        true,
                    )?;
                }
                info!("Retrying failed space {}", space);
            }
            Some(_) => {
                if let Some(progress) = &existing {
                    resume_after = progress.last_processed_upload.clone();
                    completed = progress.completed_uploads;
                    if let Some(prior) = progress.error.as_deref().and_then(FailureHistogram::from_json) {
                        histogram.merge(&prior);
                    }
                }
                if record {
                    self.store.mark_space_in_progress(
                        customer,
                        space,
                        instance_id,
                        &self.options.worker_id,
                        false,
                    )?;
                }
                if let Some(root) = &resume_after {
                    info!("Resuming space {} after {}", space, root);
                }
            }
            None => {
                if record {
                    self.store.create_space_progress(
                        customer,
                        space,
                        instance_id,
                        &self.options.worker_id,
                    )?;
                    self.store.mark_space_in_progress(
                        customer,
                        space,
                        instance_id,
                        &self.options.worker_id,
                        false,
                    )?;
                }
            }
        }

        let mut cursor = SpaceCursor {
            customer,
            space,
            processed: 0,
            completed,
            since_checkpoint: 0,
            last_root: resume_after.clone(),
        };

        let mut stop = None;
        let mut marker_found = resume_after.is_none();
        'listing: for pass in 0..2 {
            let mut page_token: Option<String> = None;
            loop {
                let page = self.list_page(space, page_token.as_deref()).await?;

                for upload in &page.uploads {
                    if !marker_found {
                        cursor.processed += 1;
                        if Some(&upload.root) == resume_after.as_ref() {
                            marker_found = true;
                        }
                        continue;
                    }

                    if let Some(reason) = self.stop_reason(report) {
                        stop = Some(reason);
                        break 'listing;
                    }

                    self.migrate_upload(upload, &mut cursor, report, histogram)
                        .await?;

                    if !self.options.upload_delay.is_zero() {
                        tokio::time::sleep(self.options.upload_delay).await;
                    }
                }

                match page.cursor {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }

            if marker_found || pass == 1 {
                break;
            }
            warn!(
                "Resume marker for space {} not found in listing; starting over",
                space
            );
            marker_found = true;
            cursor.processed = 0;
            cursor.completed = 0;
            *histogram = FailureHistogram::new();
            if record {
                self.store.mark_space_in_progress(
                    customer,
                    space,
                    instance_id,
                    &self.options.worker_id,
                    true,
                )?;
            }
        }

        if stop.is_some() {
            self.checkpoint(&mut cursor, histogram)?;
            return Ok((SpaceRunState::Interrupted, stop));
        }

        let state = if histogram.is_empty() && cursor.completed >= cursor.processed {
            SpaceRunState::Completed
        } else {
            SpaceRunState::Failed
        };
        if record {
            match state {
                SpaceRunState::Completed => {
                    self.store
                        .mark_space_completed(customer, space, cursor.processed)?;
                }
                _ => {
                    self.store.mark_space_failed(
                        customer,
                        space,
                        cursor.processed,
                        cursor.completed,
                        &histogram.to_json(),
                    )?;
                }
            }
        }
        info!(
            "Space {} {}: {}/{} uploads",
            space,
            if state == SpaceRunState::Completed { "completed" } else { "failed" },
            cursor.completed,
            cursor.processed
        );
        Ok((state, None))
    }

    async fn list_page(&self, space: &str, token: Option<&str>) -> Result<UploadPage> {
        let limit = self.options.page_size;
        retry_transient(&self.retry, "list uploads", || async move {
            self.source.list_uploads(space, token, limit).await
        })
        .await
    }

    async fn migrate_upload(
        &self,
        upload: &UploadRecord,
        cursor: &mut SpaceCursor<'_>,
        report: &mut RunReport,
        histogram: &mut FailureHistogram,
    ) -> Result<()> {
        let outcome = self.machine.migrate(upload).await;

        cursor.processed += 1;
        if outcome.success {
            cursor.completed += 1;
        }
        if let Some(reason) = outcome.reason {
            histogram.record(reason);
        }
        cursor.last_root = Some(upload.root.clone());
        cursor.since_checkpoint += 1;
        report.record(outcome);

        if cursor.since_checkpoint >= self.options.checkpoint_every {
            self.checkpoint(cursor, histogram)?;
        }
        Ok(())
    }

    fn checkpoint(&self, cursor: &mut SpaceCursor<'_>, histogram: &FailureHistogram) -> Result<()> {
        cursor.since_checkpoint = 0;
        if !self.records_progress() {
            return Ok(());
        }
        self.store.update_space_progress(
            cursor.customer,
            cursor.space,
            cursor.completed,
            cursor.last_root.as_deref(),
        )?;
        if !histogram.is_empty() {
            self.store
                .save_space_failures(cursor.customer, cursor.space, &histogram.to_json())?;
        }
        Ok(())
    }

    fn stop_reason(&self, report: &RunReport) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.options.limit {
            Some(limit) if report.uploads.total >= limit => Some(StopReason::Limit),
            _ => None,
        }
    }

    fn note_stop(&self, report: &mut RunReport, stop: StopReason) {
        match stop {
            StopReason::Cancelled => {
                report.cancelled = true;
                warn!("Run cancelled; progress checkpointed");
            }
            StopReason::Limit => {
                report.limit_reached = true;
                info!("Upload limit reached");
            }
        }
    }
}

/// Position within one space's upload listing.
struct SpaceCursor<'a> {
    customer: &'a str,
    space: &'a str,
    /// Uploads passed so far, including those skipped on resume.
    processed: u64,
    completed: u64,
    since_checkpoint: u64,
    last_root: Option<String>,
}

fn tally_space(report: &mut RunReport, state: SpaceRunState) {
    let spaces = &mut report.spaces;
    match state {
        SpaceRunState::Completed => {
            spaces.processed += 1;
            spaces.completed += 1;
        }
        SpaceRunState::Failed => {
            spaces.processed += 1;
            spaces.failed += 1;
        }
        SpaceRunState::Interrupted => {
            spaces.processed += 1;
            spaces.interrupted += 1;
        }
        SpaceRunState::Skipped => spaces.skipped += 1,
    }
}

fn counter_delta(before: &CustomerCounters, after: &CustomerCounters) -> CustomerCounters {
    CustomerCounters {
        indexes_generated: after.indexes_generated.saturating_sub(before.indexes_generated),
        location_claims_published: after
            .location_claims_published
            .saturating_sub(before.location_claims_published),
        gateway_grants: after.gateway_grants.saturating_sub(before.gateway_grants),
        gateway_skips: after.gateway_skips.saturating_sub(before.gateway_skips),
    }
}
