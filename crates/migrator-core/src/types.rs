//! Core data types for upload migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrationError;

/// A legacy upload: the DAG root plus the shards that hold its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    /// Owning space DID.
    pub space: String,
    /// Content address of the DAG root.
    pub root: String,
    /// Ordered shard content addresses (may be empty).
    #[serde(default)]
    pub shards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<String>,
}

/// A space identifier as found on a claim, normalised once at the collaborator
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SpaceIdentifier {
    /// A DID string such as `did:key:z6Mk...`.
    Did(String),
    /// Bytes that could not be decoded as a DID. Never equal to any space.
    Opaque(Vec<u8>),
}

impl SpaceIdentifier {
    /// Whether this identifier names `space`.
    pub fn is_space(&self, space: &str) -> bool {
        match self {
            SpaceIdentifier::Did(did) => did == space,
            SpaceIdentifier::Opaque(_) => false,
        }
    }

    /// Resolve the shapes a `space` field takes on the wire.
    pub fn from_raw(raw: RawSpaceField) -> Self {
        match raw {
            RawSpaceField::Text(did) => SpaceIdentifier::Did(did),
            RawSpaceField::Object { did } => SpaceIdentifier::Did(did),
            RawSpaceField::Bytes(bytes) => match String::from_utf8(bytes) {
                Ok(text) if text.starts_with("did:") => SpaceIdentifier::Did(text),
                Ok(text) => SpaceIdentifier::Opaque(text.into_bytes()),
                Err(e) => SpaceIdentifier::Opaque(e.into_bytes()),
            },
        }
    }
}

impl fmt::Display for SpaceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceIdentifier::Did(did) => write!(f, "{}", did),
            SpaceIdentifier::Opaque(bytes) => write!(f, "<{} opaque bytes>", bytes.len()),
        }
    }
}

/// The untyped forms a claim's `space` field arrives in.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSpaceField {
    Text(String),
    Bytes(Vec<u8>),
    Object { did: String },
}

/// A claim published about some content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Claim {
    /// "`index` covers `content`"
    Index { content: String, index: String },
    /// "`content` can be fetched from `location`"
    Location {
        content: String,
        location: Vec<String>,
        #[serde(default)]
        space: Option<SpaceIdentifier>,
    },
    /// Claim kinds the migrator does not interpret.
    Other { kind: String },
}

/// Everything the indexing service knows about one content address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentQuery {
    pub content: String,
    #[serde(default)]
    pub claims: Vec<Claim>,
}

impl ContentQuery {
    /// Any index claim exists for the upload, in any space.
    pub fn has_index_claim(&self) -> bool {
        self.index_id().is_some()
    }

    /// Content address of the first index covering this content.
    pub fn index_id(&self) -> Option<&str> {
        self.claims.iter().find_map(|c| match c {
            Claim::Index { index, .. } => Some(index.as_str()),
            _ => None,
        })
    }

    pub fn has_location_claim(&self) -> bool {
        self.claims
            .iter()
            .any(|c| matches!(c, Claim::Location { .. }))
    }

    /// Whether any location claim carries `space`.
    pub fn location_has_space(&self, space: &str) -> bool {
        self.claims.iter().any(|c| match c {
            Claim::Location {
                space: Some(id), ..
            } => id.is_space(space),
            _ => false,
        })
    }
}

/// Remote state of one upload, recomputed on every run and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub has_index_claim: bool,
    /// Every shard has at least one location claim.
    pub has_location_claim: bool,
    /// Every shard has a location claim carrying the upload's space.
    pub location_has_space: bool,
    pub shards_needing_location_claims: Vec<String>,
    pub needs_index_generation: bool,
    pub needs_location_claims: bool,
    pub needs_gateway_auth: bool,
}

impl MigrationStatus {
    /// Nothing left to do for this upload.
    pub fn is_satisfied(&self) -> bool {
        !self.needs_index_generation && !self.needs_location_claims && !self.needs_gateway_auth
    }
}

/// Lifecycle of a space or customer migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProgressStatus {
    /// Name stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::InProgress => "in-progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "in-progress" => Ok(ProgressStatus::InProgress),
            "completed" => Ok(ProgressStatus::Completed),
            "failed" => Ok(ProgressStatus::Failed),
            other => Err(MigrationError::Validation {
                field: "status".to_string(),
                message: format!("unknown progress status '{}'", other),
            }),
        }
    }
}

/// Progress of one space within a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceProgress {
    pub customer: String,
    pub space: String,
    pub status: ProgressStatus,
    pub total_uploads: u64,
    pub completed_uploads: u64,
    pub last_processed_upload: Option<String>,
    pub instance_id: Option<u32>,
    pub worker_id: Option<String>,
    /// A failure histogram (JSON) or free text.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters accumulated for a customer across its spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerCounters {
    pub indexes_generated: u64,
    pub location_claims_published: u64,
    pub gateway_grants: u64,
    pub gateway_skips: u64,
}

impl CustomerCounters {
    /// Add `other` into these counters.
    pub fn absorb(&mut self, other: &CustomerCounters) {
        self.indexes_generated += other.indexes_generated;
        self.location_claims_published += other.location_claims_published;
        self.gateway_grants += other.gateway_grants;
        self.gateway_skips += other.gateway_skips;
    }
}

/// Progress of one customer, created by the planner at assignment time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerProgress {
    pub customer: String,
    pub status: ProgressStatus,
    pub total_spaces: u64,
    pub completed_spaces: u64,
    pub total_uploads: u64,
    pub completed_uploads: u64,
    pub instance_id: u32,
    /// Filter the planning run was made with, for provenance.
    pub filter: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub counters: CustomerCounters,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A planner decision: which instance migrates a customer, and what it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerAssignment {
    pub customer: String,
    pub instance_id: u32,
    pub spaces: Vec<String>,
    pub upload_count: u64,
}
