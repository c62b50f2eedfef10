//! Interfaces to the external services the migration engine drives.
//!
//! The engine only needs to know whether each operation succeeded and what state
//! it leaves behind. How an index is built or a claim is signed lives behind
//! these traits; [`crate::remote`] has HTTP adapters for all of them.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{ContentQuery, UploadRecord};

/// Reason string a gateway authorizer reports when the space has no delegation
/// chain to an account.
pub const NO_DELEGATION_FOUND: &str = "no-delegation-found";

/// One page of uploads for a space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadPage {
    pub uploads: Vec<UploadRecord>,
    /// Token for the next page, `None` on the last page.
    pub cursor: Option<String>,
}

/// Enumerates upload records per space.
#[async_trait]
pub trait UploadSource: Send + Sync {
    async fn list_uploads(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<UploadPage>;
}

/// Queries the content claims / indexing service.
#[async_trait]
pub trait IndexingOracle: Send + Sync {
    async fn query(&self, content: &str) -> Result<ContentQuery>;
}

/// A built sharded index. Content addressed, so rebuilding from the same shards
/// yields the same `content_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArtifact {
    pub content_id: String,
    pub bytes: Bytes,
}

impl IndexArtifact {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Builds a sharded index for an upload.
#[async_trait]
pub trait IndexBuilder: Send + Sync {
    async fn build(&self, space: &str, root: &str, shards: &[String]) -> Result<IndexArtifact>;
}

/// Stores index artifacts, returning the URL they can be fetched from.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, space: &str, artifact: &IndexArtifact) -> Result<String>;
}

/// A location claim to publish: `content` of `size` bytes lives at `location`
/// and belongs to `space`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationClaim {
    pub space: String,
    pub content: String,
    pub size: u64,
    pub location: String,
}

/// Publishes location claims. Publication is additive: publishing twice leaves
/// at most a duplicate record.
#[async_trait]
pub trait ClaimPublisher: Send + Sync {
    async fn publish_location(&self, claim: &LocationClaim) -> Result<()>;
}

/// Registers a published index with the indexing service.
#[async_trait]
pub trait IndexRegistrar: Send + Sync {
    async fn register_index(&self, space: &str, root: &str, index: &str) -> Result<()>;
}

/// Hands shards to the downstream discovery system.
#[async_trait]
pub trait AdvertisementQueue: Send + Sync {
    async fn enqueue(&self, shard: &str, location: &str) -> Result<()>;
}

/// What the gateway authorizer did for a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GatewayGrant {
    Granted,
    /// Nothing was granted, and that is expected (e.g. [`NO_DELEGATION_FOUND`]).
    Skipped { reason: String },
}

/// Grants a content-serving gateway the right to serve a space.
#[async_trait]
pub trait GatewayAuthorizer: Send + Sync {
    async fn grant(&self, space: &str) -> Result<GatewayGrant>;
}

/// One backing table of shard sizes.
#[async_trait]
pub trait SizeTable: Send + Sync {
    fn name(&self) -> &str;
    async fn lookup(&self, space: &str, shard: &str) -> Result<Option<u64>>;
}

/// Resolves the byte size of a shard.
#[async_trait]
pub trait SizeResolver: Send + Sync {
    async fn resolve(&self, space: &str, shard: &str) -> Result<u64>;
}

/// Point lookup of a space's owning customer.
#[async_trait]
pub trait OwnershipIndex: Send + Sync {
    async fn customer_of(&self, space: &str) -> Result<Option<String>>;
}

/// A `(space, customer)` ownership pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub space: String,
    pub customer: String,
}

/// One page of a segmented ownership scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnershipPage {
    pub entries: Vec<Ownership>,
    pub cursor: Option<String>,
}

/// Full scan of the ownership mapping, split into parallel segments.
#[async_trait]
pub trait OwnershipScanner: Send + Sync {
    async fn scan_segment(
        &self,
        segment: u32,
        total_segments: u32,
        cursor: Option<&str>,
    ) -> Result<OwnershipPage>;
}

/// Counts uploads per space.
#[async_trait]
pub trait UploadCounter: Send + Sync {
    async fn count_uploads(&self, space: &str) -> Result<u64>;
}

/// The remote operations the step machine executes.
#[derive(Clone)]
pub struct StepExecutors {
    pub oracle: Arc<dyn IndexingOracle>,
    pub index_builder: Arc<dyn IndexBuilder>,
    pub blobs: Arc<dyn BlobStore>,
    pub claims: Arc<dyn ClaimPublisher>,
    pub registrar: Arc<dyn IndexRegistrar>,
    pub advertisements: Arc<dyn AdvertisementQueue>,
    pub gateway: Arc<dyn GatewayAuthorizer>,
    pub sizes: Arc<dyn SizeResolver>,
}
