//! Centralized configuration for the migration engine.
//!
//! Constant tables hold the defaults; [`MigrationSettings`] is the JSON file an
//! operator hands to the binary, with every field optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MigrationError, Result};
use crate::persist::read_json;

/// Backoff for point queries (counts, size lookups, table scans).
pub struct RetryDefaults;

impl RetryDefaults {
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Partition planner defaults.
pub struct PlannerDefaults;

impl PlannerDefaults {
    pub const SEGMENTS: u32 = 4;
    pub const MIN_SEGMENTS: u32 = 1;
    pub const MAX_SEGMENTS: u32 = 10;
    pub const COUNT_CHECKPOINT_EVERY: usize = 50;
    pub const CHECKPOINT_FILENAME: &'static str = "planner-checkpoint.json";
    pub const ASSIGNMENT_DIR_NAME: &'static str = "assignments";
}

/// Per-instance run defaults.
pub struct RunDefaults;

impl RunDefaults {
    pub const CHECKPOINT_EVERY: u64 = 10;
    pub const UPLOAD_DELAY: Duration = Duration::from_millis(100);
    pub const PAGE_SIZE: usize = 100;
    pub const RESULTS_FILE_PREFIX: &'static str = "migration-results";
    pub const LOCATION_URL_TEMPLATE: &'static str = "https://carpark.example/{shard}/{shard}.car";
}

/// Progress store defaults.
pub struct ProgressDefaults;

impl ProgressDefaults {
    pub const DATABASE_FILENAME: &'static str = "migration-progress.sqlite";
    pub const STUCK_AFTER: Duration = Duration::from_secs(3600);
    pub const OWNER_CACHE_TTL: Duration = Duration::from_secs(600);
    pub const OWNER_CACHE_CAPACITY: u64 = 100_000;
}

/// HTTP adapter defaults.
pub struct RemoteDefaults;

impl RemoteDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = concat!("upload-migrator/", env!("CARGO_PKG_VERSION"));
}

/// Base URLs of the remote collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServiceEndpoints {
    pub uploads: Option<String>,
    pub indexing: Option<String>,
    pub index_worker: Option<String>,
    pub blobs: Option<String>,
    pub claims: Option<String>,
    pub gateway: Option<String>,
    pub ownership: Option<String>,
    pub sizes: Option<String>,
    pub advertisements: Option<String>,
    /// Bearer token sent to every service, if set.
    pub auth_token: Option<String>,
}

impl ServiceEndpoints {
    /// Return an endpoint or a configuration error naming it.
    pub fn require<'a>(&self, name: &str, value: &'a Option<String>) -> Result<&'a str> {
        value.as_deref().ok_or_else(|| MigrationError::Config {
            message: format!("service endpoint '{}' is not configured", name),
        })
    }
}

/// Partition planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PlannerSettings {
    /// Number of worker instances to partition across.
    pub instances: u32,
    /// Parallel segments for the ownership scan.
    pub segments: u32,
    /// Customers never planned. An entry ending in `*` matches by prefix.
    pub skip_customers: Vec<String>,
    /// If non-empty, only matching customers are planned.
    pub include_customers: Vec<String>,
    /// Customers counted between checkpoint writes.
    pub count_checkpoint_every: usize,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            instances: 1,
            segments: PlannerDefaults::SEGMENTS,
            skip_customers: Vec::new(),
            include_customers: Vec::new(),
            count_checkpoint_every: PlannerDefaults::COUNT_CHECKPOINT_EVERY,
        }
    }
}

impl PlannerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(MigrationError::Validation {
                field: "instances".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(PlannerDefaults::MIN_SEGMENTS..=PlannerDefaults::MAX_SEGMENTS).contains(&self.segments)
        {
            return Err(MigrationError::Validation {
                field: "segments".to_string(),
                message: format!(
                    "must be between {} and {}",
                    PlannerDefaults::MIN_SEGMENTS,
                    PlannerDefaults::MAX_SEGMENTS
                ),
            });
        }
        if self.count_checkpoint_every == 0 {
            return Err(MigrationError::Validation {
                field: "count_checkpoint_every".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Operator-supplied settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MigrationSettings {
    pub endpoints: ServiceEndpoints,
    pub planner: PlannerSettings,
    /// Remote requests per second across all adapters (0 = unlimited).
    pub requests_per_second: u32,
    pub checkpoint_every: u64,
    pub upload_delay_ms: u64,
    pub page_size: usize,
    pub stuck_after_secs: u64,
    /// Treat a skipped gateway authorization as a failed verification.
    pub require_gateway_auth: bool,
    pub location_url_template: String,
    /// Size tables in precedence order (oldest first).
    pub size_tables: Vec<String>,
    pub progress_db: Option<PathBuf>,
    pub output_dir: PathBuf,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            endpoints: ServiceEndpoints::default(),
            planner: PlannerSettings::default(),
            requests_per_second: 0,
            checkpoint_every: RunDefaults::CHECKPOINT_EVERY,
            upload_delay_ms: RunDefaults::UPLOAD_DELAY.as_millis() as u64,
            page_size: RunDefaults::PAGE_SIZE,
            stuck_after_secs: ProgressDefaults::STUCK_AFTER.as_secs(),
            require_gateway_auth: false,
            location_url_template: RunDefaults::LOCATION_URL_TEMPLATE.to_string(),
            size_tables: vec![
                "blob-registry-v1".to_string(),
                "store-table".to_string(),
                "allocations".to_string(),
            ],
            progress_db: None,
            output_dir: PathBuf::from("."),
        }
    }
}

impl MigrationSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = read_json::<Self>(path)?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.planner.validate()?;
        if self.checkpoint_every == 0 {
            return Err(MigrationError::Validation {
                field: "checkpoint_every".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.page_size == 0 {
            return Err(MigrationError::Validation {
                field: "page_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !self.location_url_template.contains("{shard}") {
            return Err(MigrationError::Validation {
                field: "location_url_template".to_string(),
                message: "must contain a {shard} placeholder".to_string(),
            });
        }
        Ok(())
    }

    /// Pause between uploads.
    pub fn upload_delay(&self) -> Duration {
        Duration::from_millis(self.upload_delay_ms)
    }

    /// Age after which an `in-progress` row counts as stuck.
    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }

    /// Path of the progress database, defaulting into the output directory.
    pub fn progress_db_path(&self) -> PathBuf {
        self.progress_db
            .clone()
            .unwrap_or_else(|| self.output_dir.join(ProgressDefaults::DATABASE_FILENAME))
    }

    /// Location URL for a shard.
    pub fn location_for(&self, shard: &str) -> String {
        self.location_url_template.replace("{shard}", shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = MigrationSettings::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(settings.checkpoint_every, RunDefaults::CHECKPOINT_EVERY);
        assert_eq!(settings.size_tables.len(), 3);
        assert!(!settings.require_gateway_auth);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"checkpoint_every": 25, "endpoints": {"indexing": "https://indexer.example"}}"#,
        )
        .unwrap();

        let settings = MigrationSettings::load(&path).unwrap();
        assert_eq!(settings.checkpoint_every, 25);
        assert_eq!(settings.page_size, RunDefaults::PAGE_SIZE);
        assert_eq!(
            settings.endpoints.indexing.as_deref(),
            Some("https://indexer.example")
        );
        assert!(settings
            .endpoints
            .require("claims", &settings.endpoints.claims)
            .is_err());
    }

    #[test]
    fn test_validation_rejects_zero_checkpoint() {
        let settings = MigrationSettings {
            checkpoint_every: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_planner_segments_bounded() {
        let mut planner = PlannerSettings::default();
        assert!(planner.validate().is_ok());
        planner.segments = 11;
        assert!(planner.validate().is_err());
        planner.segments = 0;
        assert!(planner.validate().is_err());
        planner.segments = 10;
        planner.instances = 0;
        assert!(planner.validate().is_err());
    }

    #[test]
    fn test_location_template() {
        let settings = MigrationSettings::default();
        assert_eq!(
            settings.location_for("bagabc"),
            "https://carpark.example/bagabc/bagabc.car"
        );
    }
}
