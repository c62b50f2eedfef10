//! Partition planner: divides the customer population across worker instances.
//!
//! Planning runs once, offline:
//!
//! 1. scan the space → customer ownership mapping in parallel segments
//! 2. drop customers rejected by the skip / include filters
//! 3. count uploads per customer, checkpointing to disk as it goes
//! 4. assign customers greedily to the least-loaded instance
//! 5. publish one assignment file per instance plus the customer → instance
//!    index in the progress store
//!
//! Nothing is published until every step before it has succeeded.

mod assign;
mod filter;

pub use assign::{assign_customers, CustomerLoad, InstanceLoad};
pub use filter::{CustomerFilter, CustomerPattern};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{Ownership, OwnershipScanner, UploadCounter};
use crate::config::{PlannerDefaults, PlannerSettings};
use crate::error::{MigrationError, Result};
use crate::persist::{read_json, write_json};
use crate::progress::ProgressStore;
use crate::retry::{retry_transient, RetryConfig};
use crate::types::CustomerAssignment;

/// Contents of one published per-instance assignment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAssignment {
    pub instance_id: u32,
    pub planned_at: DateTime<Utc>,
    pub total_uploads: u64,
    pub customers: Vec<CustomerAssignment>,
}

/// Path of the assignment file for `instance_id` inside `dir`.
pub fn assignment_path(dir: &Path, instance_id: u32) -> PathBuf {
    dir.join(format!("instance-{}.json", instance_id))
}

/// Load a published assignment file.
pub fn read_instance_assignment(path: &Path) -> Result<InstanceAssignment> {
    read_json(path)?.ok_or_else(|| MigrationError::NotFound {
        kind: "assignment file",
        id: path.display().to_string(),
    })
}

/// Counting progress saved between batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountCheckpoint {
    /// Size of the candidate list the checkpoint was taken against.
    candidates: usize,
    counted: Vec<CustomerLoad>,
}

/// A computed, not yet published, plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub planned_at: DateTime<Utc>,
    pub assignments: Vec<CustomerAssignment>,
    pub instances: Vec<InstanceLoad>,
    /// Customers dropped by the filters.
    pub filtered_out: u64,
    pub filter: Option<String>,
}

impl Plan {
    pub fn total_uploads(&self) -> u64 {
        self.instances.iter().map(|i| i.uploads).sum()
    }

    pub fn total_spaces(&self) -> u64 {
        self.assignments.iter().map(|a| a.spaces.len() as u64).sum()
    }

    /// `(max - min) / max` of instance loads, as a percentage.
    pub fn skew_percent(&self) -> f64 {
        let max = self.instances.iter().map(|i| i.uploads).max().unwrap_or(0);
        let min = self.instances.iter().map(|i| i.uploads).min().unwrap_or(0);
        if max == 0 {
            return 0.0;
        }
        (max - min) as f64 * 100.0 / max as f64
    }

    /// Assignments of one instance, in plan order.
    pub fn for_instance(&self, instance_id: u32) -> Vec<CustomerAssignment> {
        self.assignments
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect()
    }
}

/// Plans and publishes a customer → instance partition.
pub struct PartitionPlanner {
    scanner: Arc<dyn OwnershipScanner>,
    counter: Arc<dyn UploadCounter>,
    store: Arc<dyn ProgressStore>,
    settings: PlannerSettings,
    retry: RetryConfig,
    work_dir: PathBuf,
}

impl PartitionPlanner {
    pub fn new(
        scanner: Arc<dyn OwnershipScanner>,
        counter: Arc<dyn UploadCounter>,
        store: Arc<dyn ProgressStore>,
        settings: PlannerSettings,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            scanner,
            counter,
            store,
            settings,
            retry: RetryConfig::default(),
            work_dir: work_dir.into(),
        })
    }

    /// Retry policy for scan pages and upload counts.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Upload-count checkpoint, removed once a plan is published.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.work_dir.join(PlannerDefaults::CHECKPOINT_FILENAME)
    }

    /// Directory holding the published `instance-N.json` files.
    pub fn assignment_dir(&self) -> PathBuf {
        self.work_dir.join(PlannerDefaults::ASSIGNMENT_DIR_NAME)
    }

    /// Compute and publish a plan.
    pub async fn plan(&self) -> Result<Plan> {
        let plan = self.build_plan().await?;
        self.publish(&plan)?;
        Ok(plan)
    }

    /// Compute a plan without publishing anything.
    pub async fn build_plan(&self) -> Result<Plan> {
        let owners = self.scan_ownership().await?;
        let filter = CustomerFilter::new(
            &self.settings.skip_customers,
            &self.settings.include_customers,
        );

        let total = owners.len();
        let candidates: Vec<(String, Vec<String>)> = owners
            .into_iter()
            .filter(|(customer, _)| filter.allows(customer))
            .map(|(customer, spaces)| (customer, spaces.into_iter().collect()))
            .collect();
        let filtered_out = (total - candidates.len()) as u64;
        info!(
            "Discovered {} customers, {} after filtering",
            total,
            candidates.len()
        );

        let loads = self.count_uploads(&candidates).await?;
        let (assignments, instances) = assign_customers(&loads, self.settings.instances);

        for instance in &instances {
            info!(
                "Instance {}: {} customers, {} uploads",
                instance.instance_id, instance.customers, instance.uploads
            );
        }

        Ok(Plan {
            planned_at: Utc::now(),
            assignments,
            instances,
            filtered_out,
            filter: filter.describe(),
        })
    }

    /// Parallel segmented scan of the ownership mapping into `customer → spaces`.
    pub async fn scan_ownership(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let total = self.settings.segments;
        let segments = (0..total).map(|segment| self.scan_segment(segment, total));
        let results = try_join_all(segments).await?;

        let mut owners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entries in results {
            for Ownership { space, customer } in entries {
                owners.entry(customer).or_default().insert(space);
            }
        }
        Ok(owners)
    }

    async fn scan_segment(&self, segment: u32, total: u32) -> Result<Vec<Ownership>> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page_cursor = cursor.as_deref();
            let page = retry_transient(&self.retry, "ownership scan", || async move {
                self.scanner.scan_segment(segment, total, page_cursor).await
            })
            .await
            .map_err(|e| MigrationError::Planning {
                message: format!("ownership scan of segment {}/{} failed: {}", segment, total, e),
            })?;

            entries.extend(page.entries);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!("Segment {}/{} yielded {} entries", segment, total, entries.len());
        Ok(entries)
    }

    async fn count_uploads(&self, candidates: &[(String, Vec<String>)]) -> Result<Vec<CustomerLoad>> {
        let checkpoint_path = self.checkpoint_path();
        let mut counted = self.resume_counts(&checkpoint_path, candidates)?;
        if !counted.is_empty() {
            info!(
                "Resuming upload counts at customer {}/{}",
                counted.len(),
                candidates.len()
            );
        }

        let every = self.settings.count_checkpoint_every;
        for (index, (customer, spaces)) in candidates.iter().enumerate().skip(counted.len()) {
            let mut upload_count = 0;
            for space in spaces {
                upload_count += retry_transient(&self.retry, "upload count", || async move {
                    self.counter.count_uploads(space).await
                })
                .await
                .map_err(|e| MigrationError::Planning {
                    message: format!("counting uploads of {} failed: {}", space, e),
                })?;
            }
            counted.push(CustomerLoad {
                customer: customer.clone(),
                spaces: spaces.clone(),
                upload_count,
            });

            if (index + 1) % every == 0 {
                self.save_counts(&checkpoint_path, candidates.len(), &counted)?;
                debug!("Counted {}/{} customers", index + 1, candidates.len());
            }
        }

        self.save_counts(&checkpoint_path, candidates.len(), &counted)?;
        Ok(counted)
    }

    fn resume_counts(
        &self,
        path: &Path,
        candidates: &[(String, Vec<String>)],
    ) -> Result<Vec<CustomerLoad>> {
        let checkpoint: CountCheckpoint = match read_json(path) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                warn!("Ignoring unreadable count checkpoint: {}", e);
                return Ok(Vec::new());
            }
        };

        let matches = checkpoint.candidates == candidates.len()
            && checkpoint.counted.len() <= candidates.len()
            && checkpoint
                .counted
                .iter()
                .zip(candidates)
                .all(|(load, (customer, spaces))| {
                    &load.customer == customer && &load.spaces == spaces
                });
        if !matches {
            warn!("Count checkpoint does not match the current customer set; recounting");
            return Ok(Vec::new());
        }
        Ok(checkpoint.counted)
    }

    fn save_counts(&self, path: &Path, candidates: usize, counted: &[CustomerLoad]) -> Result<()> {
        write_json(
            path,
            &CountCheckpoint {
                candidates,
                counted: counted.to_vec(),
            },
        )
    }

    /// Write per-instance files and the store index, then drop the count checkpoint.
    pub fn publish(&self, plan: &Plan) -> Result<PathBuf> {
        let final_dir = self.assignment_dir();
        let staging = self.work_dir.join(format!(
            "{}.staging-{}",
            PlannerDefaults::ASSIGNMENT_DIR_NAME,
            std::process::id()
        ));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| MigrationError::io_with_path(e, &staging))?;
        }

        for instance in &plan.instances {
            let file = InstanceAssignment {
                instance_id: instance.instance_id,
                planned_at: plan.planned_at,
                total_uploads: instance.uploads,
                customers: plan.for_instance(instance.instance_id),
            };
            write_json(&assignment_path(&staging, instance.instance_id), &file)?;
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)
                .map_err(|e| MigrationError::io_with_path(e, &final_dir))?;
        }
        fs::rename(&staging, &final_dir).map_err(|e| MigrationError::io_with_path(e, &final_dir))?;

        self.store
            .replace_assignments(&plan.assignments, plan.filter.as_deref())?;

        let checkpoint = self.checkpoint_path();
        if checkpoint.exists() {
            fs::remove_file(&checkpoint).map_err(|e| MigrationError::io_with_path(e, &checkpoint))?;
        }

        info!(
            "Published {} assignments across {} instances to {}",
            plan.assignments.len(),
            plan.instances.len(),
            final_dir.display()
        );
        Ok(final_dir)
    }
}
