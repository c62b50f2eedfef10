//! Hierarchical progress store: customer → space.
//!
//! The space level gives fine-grained resume (completed spaces are never
//! reprocessed); the customer level gives one success/fail signal per account.
//! The store also holds the planner's customer → instance index, so workers can
//! discover their cohort without the original assignment file. Publishing a
//! plan replaces that index in one transaction; customers left out of the new
//! plan keep their rows but are no longer assigned anywhere.
//!
//! Progress writes are either create-if-absent or unconditional status updates, so
//! instances need no locking beyond what the assignment already guarantees.

mod sqlite;

pub use sqlite::SqliteProgressStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::failure::FailureHistogram;
use crate::types::{CustomerAssignment, CustomerCounters, CustomerProgress, SpaceProgress};

/// Roll-up written to a customer row when its spaces have been processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerTotals {
    pub total_spaces: u64,
    pub completed_spaces: u64,
    pub total_uploads: u64,
    pub completed_uploads: u64,
    pub counters: CustomerCounters,
}

/// A slice of progress rows selected for triage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSelection {
    pub customers: Vec<CustomerProgress>,
    pub spaces: Vec<SpaceProgress>,
}

impl ProgressSelection {
    /// No customer and no space selected.
    pub fn is_empty(&self) -> bool {
        self.customers.is_empty() && self.spaces.is_empty()
    }
}

/// Aggregate statistics over every progress row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub customers_by_status: BTreeMap<String, u64>,
    pub spaces_by_status: BTreeMap<String, u64>,
    pub total_uploads: u64,
    pub completed_uploads: u64,
    /// Merged from the histograms on failed space rows.
    pub failure_reasons: FailureHistogram,
    pub counters: CustomerCounters,
}

impl ProgressStats {
    pub fn customer_count(&self) -> u64 {
        self.customers_by_status.values().sum()
    }

    pub fn space_count(&self) -> u64 {
        self.spaces_by_status.values().sum()
    }
}

/// Persistent progress records.
///
/// Operations are synchronous to match rusqlite's API.
pub trait ProgressStore: Send + Sync {
    // Space level

    /// Fetch one space row, if it exists.
    fn get_space_progress(&self, customer: &str, space: &str) -> Result<Option<SpaceProgress>>;

    /// Create a pending row. Returns `false` (and changes nothing) if one exists.
    fn create_space_progress(
        &self,
        customer: &str,
        space: &str,
        instance_id: Option<u32>,
        worker_id: &str,
    ) -> Result<bool>;

    /// Claim a space for this worker. `restart` clears the counters, resume
    /// marker and stored failures for a fresh pass.
    fn mark_space_in_progress(
        &self,
        customer: &str,
        space: &str,
        instance_id: Option<u32>,
        worker_id: &str,
        restart: bool,
    ) -> Result<()>;

    /// Checkpoint. `completed_uploads` never moves backwards.
    fn update_space_progress(
        &self,
        customer: &str,
        space: &str,
        completed_uploads: u64,
        last_processed_upload: Option<&str>,
    ) -> Result<()>;

    /// Store the failure histogram of a space still in progress, so a resumed
    /// run keeps counting from it.
    fn save_space_failures(&self, customer: &str, space: &str, histogram: &str) -> Result<()>;

    /// Terminal success: every one of `total_uploads` is migrated.
    fn mark_space_completed(&self, customer: &str, space: &str, total_uploads: u64) -> Result<()>;

    /// Terminal failure with the space's failure histogram as `error`.
    /// `completed_uploads` is capped at `total_uploads`.
    fn mark_space_failed(
        &self,
        customer: &str,
        space: &str,
        total_uploads: u64,
        completed_uploads: u64,
        error: &str,
    ) -> Result<()>;

    /// Every space row of a customer, ordered by space.
    fn list_space_progress(&self, customer: &str) -> Result<Vec<SpaceProgress>>;

    // Customer level

    /// Fetch one customer row, assigned or not.
    fn get_customer_progress(&self, customer: &str) -> Result<Option<CustomerProgress>>;

    fn mark_customer_in_progress(&self, customer: &str) -> Result<()>;

    /// Write the roll-up and stamp `completed_at`.
    fn mark_customer_completed(&self, customer: &str, totals: &CustomerTotals) -> Result<()>;

    /// Write the roll-up with `error` (a failure histogram or a summary line).
    fn mark_customer_failed(
        &self,
        customer: &str,
        totals: &CustomerTotals,
        error: &str,
    ) -> Result<()>;

    // Assignment index

    /// Record a planner assignment, creating the customer row if absent.
    fn save_assignment(&self, assignment: &CustomerAssignment, filter: Option<&str>) -> Result<()>;

    /// Publish a whole plan as the assignment index, atomically.
    ///
    /// Customers missing from `assignments` drop out of the index but keep
    /// their progress rows; the rest are upserted as by [`save_assignment`].
    ///
    /// [`save_assignment`]: ProgressStore::save_assignment
    fn replace_assignments(
        &self,
        assignments: &[CustomerAssignment],
        filter: Option<&str>,
    ) -> Result<()>;

    /// Currently assigned customers of one instance, with their spaces.
    fn assignments_for_instance(&self, instance_id: u32) -> Result<Vec<CustomerAssignment>>;

    /// Instance a customer is currently assigned to.
    fn instance_of(&self, customer: &str) -> Result<Option<u32>>;

    // Triage

    /// Customer and space rows with status `failed`.
    fn get_failed_migrations(&self) -> Result<ProgressSelection>;

    /// Rows `in-progress` whose last update is older than `staleness`.
    fn get_stuck_migrations(&self, staleness: Duration) -> Result<ProgressSelection>;

    /// Counts by status, upload totals and the merged failure histogram.
    fn scan_all_progress(&self) -> Result<ProgressStats>;
}
