//! One adapter per collaborator trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{endpoint, RemoteClient, ServiceKind};
use crate::collaborators::{
    AdvertisementQueue, BlobStore, ClaimPublisher, GatewayAuthorizer, GatewayGrant,
    IndexArtifact, IndexBuilder, IndexRegistrar, IndexingOracle, LocationClaim, OwnershipIndex,
    OwnershipPage, OwnershipScanner, SizeTable, StepExecutors, UploadCounter, UploadPage,
    UploadSource,
};
use crate::config::MigrationSettings;
use crate::error::{MigrationError, Result};
use crate::sizes::TieredSizeResolver;
use crate::types::{Claim, ContentQuery, RawSpaceField, SpaceIdentifier};

/// Header carrying the content id of a built index.
const CONTENT_ID_HEADER: &str = "x-content-id";

pub struct HttpUploadSource {
    client: RemoteClient,
    base: String,
}

impl HttpUploadSource {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl UploadSource for HttpUploadSource {
    async fn list_uploads(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<UploadPage> {
        let limit = limit.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let url = endpoint(&self.base, &["spaces", space, "uploads"], &query)?;
        let response = self
            .client
            .send("uploads", ServiceKind::Other, self.client.get(url))
            .await?;
        RemoteClient::json("uploads", response).await
    }
}

#[derive(Deserialize)]
struct CountResponse {
    count: u64,
}

pub struct HttpUploadCounter {
    client: RemoteClient,
    base: String,
}

impl HttpUploadCounter {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl UploadCounter for HttpUploadCounter {
    async fn count_uploads(&self, space: &str) -> Result<u64> {
        let url = endpoint(&self.base, &["spaces", space, "uploads", "count"], &[])?;
        let response = self
            .client
            .send("uploads", ServiceKind::Other, self.client.get(url))
            .await?;
        let body: CountResponse = RemoteClient::json("uploads", response).await?;
        Ok(body.count)
    }
}

/// Claim as the indexing service sends it. The `space` field arrives in
/// several shapes and is normalised here, once.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireClaim {
    Index {
        content: String,
        index: String,
    },
    Location {
        content: String,
        #[serde(default)]
        location: Vec<String>,
        #[serde(default)]
        space: Option<RawSpaceField>,
    },
    #[serde(other)]
    Unknown,
}

impl From<WireClaim> for Claim {
    fn from(wire: WireClaim) -> Self {
        match wire {
            WireClaim::Index { content, index } => Claim::Index { content, index },
            WireClaim::Location {
                content,
                location,
                space,
            } => Claim::Location {
                content,
                location,
                space: space.map(SpaceIdentifier::from_raw),
            },
            WireClaim::Unknown => Claim::Other {
                kind: "unknown".to_string(),
            },
        }
    }
}

#[derive(Deserialize)]
struct WireQuery {
    #[serde(default)]
    claims: Vec<WireClaim>,
}

fn content_query(content: &str, wire: WireQuery) -> ContentQuery {
    ContentQuery {
        content: content.to_string(),
        claims: wire.claims.into_iter().map(Claim::from).collect(),
    }
}

pub struct HttpIndexingOracle {
    client: RemoteClient,
    base: String,
}

impl HttpIndexingOracle {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl IndexingOracle for HttpIndexingOracle {
    async fn query(&self, content: &str) -> Result<ContentQuery> {
        let url = endpoint(&self.base, &["claims"], &[("content", content)])?;
        let response = self
            .client
            .send("indexing", ServiceKind::Indexing, self.client.get(url))
            .await?;
        let wire: WireQuery = RemoteClient::json("indexing", response).await?;
        Ok(content_query(content, wire))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterIndexRequest<'a> {
    space: &'a str,
    root: &'a str,
    index: &'a str,
}

pub struct HttpIndexRegistrar {
    client: RemoteClient,
    base: String,
}

impl HttpIndexRegistrar {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl IndexRegistrar for HttpIndexRegistrar {
    async fn register_index(&self, space: &str, root: &str, index: &str) -> Result<()> {
        let url = endpoint(&self.base, &["index"], &[])?;
        let request = self
            .client
            .post(url)
            .json(&RegisterIndexRequest { space, root, index });
        self.client
            .send("indexing", ServiceKind::Indexing, request)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildIndexRequest<'a> {
    space: &'a str,
    root: &'a str,
    shards: &'a [String],
}

pub struct HttpIndexBuilder {
    client: RemoteClient,
    base: String,
}

impl HttpIndexBuilder {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl IndexBuilder for HttpIndexBuilder {
    async fn build(&self, space: &str, root: &str, shards: &[String]) -> Result<IndexArtifact> {
        let url = endpoint(&self.base, &["build"], &[])?;
        let request = self
            .client
            .post(url)
            .json(&BuildIndexRequest { space, root, shards });
        let response = self
            .client
            .send("index-worker", ServiceKind::Other, request)
            .await?;

        let content_id = response
            .headers()
            .get(CONTENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                MigrationError::collaborator("build index", "response has no content id")
            })?;
        let bytes = response.bytes().await?;
        Ok(IndexArtifact { content_id, bytes })
    }
}

#[derive(Deserialize)]
struct PutBlobResponse {
    url: String,
}

pub struct HttpBlobStore {
    client: RemoteClient,
    base: String,
}

impl HttpBlobStore {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, space: &str, artifact: &IndexArtifact) -> Result<String> {
        let url = endpoint(&self.base, &[space, artifact.content_id.as_str()], &[])?;
        let request = self.client.put(url).body(artifact.bytes.clone());
        let response = self
            .client
            .send("blobs", ServiceKind::Other, request)
            .await?;
        let body: PutBlobResponse = RemoteClient::json("blobs", response).await?;
        Ok(body.url)
    }
}

pub struct HttpClaimPublisher {
    client: RemoteClient,
    base: String,
}

impl HttpClaimPublisher {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl ClaimPublisher for HttpClaimPublisher {
    async fn publish_location(&self, claim: &LocationClaim) -> Result<()> {
        let url = endpoint(&self.base, &["claims", "location"], &[])?;
        let request = self.client.post(url).json(claim);
        self.client
            .send("claims", ServiceKind::Other, request)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct AdvertisementJob<'a> {
    shard: &'a str,
    location: &'a str,
}

pub struct HttpAdvertisementQueue {
    client: RemoteClient,
    base: String,
}

impl HttpAdvertisementQueue {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl AdvertisementQueue for HttpAdvertisementQueue {
    async fn enqueue(&self, shard: &str, location: &str) -> Result<()> {
        let url = endpoint(&self.base, &["jobs"], &[])?;
        let request = self.client.post(url).json(&AdvertisementJob { shard, location });
        self.client
            .send("advertisements", ServiceKind::Other, request)
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct GrantRequest<'a> {
    space: &'a str,
}

pub struct HttpGatewayAuthorizer {
    client: RemoteClient,
    base: String,
}

impl HttpGatewayAuthorizer {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl GatewayAuthorizer for HttpGatewayAuthorizer {
    async fn grant(&self, space: &str) -> Result<GatewayGrant> {
        let url = endpoint(&self.base, &["authorize"], &[])?;
        let request = self.client.post(url).json(&GrantRequest { space });
        let response = self
            .client
            .send("gateway", ServiceKind::Other, request)
            .await?;
        RemoteClient::json("gateway", response).await
    }
}

#[derive(Deserialize)]
struct SizeResponse {
    size: u64,
}

/// One named size table behind the sizes service.
pub struct HttpSizeTable {
    client: RemoteClient,
    base: String,
    name: String,
}

impl HttpSizeTable {
    pub fn new(client: RemoteClient, base: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl SizeTable for HttpSizeTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, space: &str, shard: &str) -> Result<Option<u64>> {
        let url = endpoint(&self.base, &["tables", self.name.as_str(), space, shard], &[])?;
        let response = self
            .client
            .send_optional("sizes", ServiceKind::Other, self.client.get(url))
            .await?;
        match response {
            Some(response) => {
                let body: SizeResponse = RemoteClient::json("sizes", response).await?;
                Ok(Some(body.size))
            }
            None => Ok(None),
        }
    }
}

#[derive(Deserialize)]
struct OwnerResponse {
    customer: Option<String>,
}

pub struct HttpOwnershipIndex {
    client: RemoteClient,
    base: String,
}

impl HttpOwnershipIndex {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl OwnershipIndex for HttpOwnershipIndex {
    async fn customer_of(&self, space: &str) -> Result<Option<String>> {
        let url = endpoint(&self.base, &["spaces", space, "customer"], &[])?;
        let response = self
            .client
            .send_optional("ownership", ServiceKind::Other, self.client.get(url))
            .await?;
        match response {
            Some(response) => {
                let body: OwnerResponse = RemoteClient::json("ownership", response).await?;
                Ok(body.customer)
            }
            None => Ok(None),
        }
    }
}

pub struct HttpOwnershipScanner {
    client: RemoteClient,
    base: String,
}

impl HttpOwnershipScanner {
    pub fn new(client: RemoteClient, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

#[async_trait]
impl OwnershipScanner for HttpOwnershipScanner {
    async fn scan_segment(
        &self,
        segment: u32,
        total_segments: u32,
        cursor: Option<&str>,
    ) -> Result<OwnershipPage> {
        let segment = segment.to_string();
        let total = total_segments.to_string();
        let mut query = vec![("segment", segment.as_str()), ("total", total.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let url = endpoint(&self.base, &["scan"], &query)?;
        let response = self
            .client
            .send("ownership", ServiceKind::Other, self.client.get(url))
            .await?;
        RemoteClient::json("ownership", response).await
    }
}

/// Every remote collaborator, wired from settings.
pub struct RemoteServices {
    pub executors: StepExecutors,
    pub uploads: Arc<dyn UploadSource>,
    pub counter: Arc<dyn UploadCounter>,
    pub ownership: Arc<dyn OwnershipIndex>,
    pub scanner: Arc<dyn OwnershipScanner>,
}

impl RemoteServices {
    pub fn from_settings(settings: &MigrationSettings) -> Result<Self> {
        let endpoints = &settings.endpoints;
        let client = RemoteClient::new(settings.requests_per_second, endpoints.auth_token.clone())?;

        let uploads = endpoints.require("uploads", &endpoints.uploads)?;
        let indexing = endpoints.require("indexing", &endpoints.indexing)?;
        let index_worker = endpoints.require("index_worker", &endpoints.index_worker)?;
        let blobs = endpoints.require("blobs", &endpoints.blobs)?;
        let claims = endpoints.require("claims", &endpoints.claims)?;
        let gateway = endpoints.require("gateway", &endpoints.gateway)?;
        let ownership = endpoints.require("ownership", &endpoints.ownership)?;
        let sizes = endpoints.require("sizes", &endpoints.sizes)?;
        let advertisements = endpoints.require("advertisements", &endpoints.advertisements)?;

        let tables: Vec<Arc<dyn SizeTable>> = settings
            .size_tables
            .iter()
            .map(|name| {
                Arc::new(HttpSizeTable::new(client.clone(), sizes, name.as_str()))
                    as Arc<dyn SizeTable>
            })
            .collect();

        let executors = StepExecutors {
            oracle: Arc::new(HttpIndexingOracle::new(client.clone(), indexing)),
            index_builder: Arc::new(HttpIndexBuilder::new(client.clone(), index_worker)),
            blobs: Arc::new(HttpBlobStore::new(client.clone(), blobs)),
            claims: Arc::new(HttpClaimPublisher::new(client.clone(), claims)),
            registrar: Arc::new(HttpIndexRegistrar::new(client.clone(), indexing)),
            advertisements: Arc::new(HttpAdvertisementQueue::new(client.clone(), advertisements)),
            gateway: Arc::new(HttpGatewayAuthorizer::new(client.clone(), gateway)),
            sizes: Arc::new(TieredSizeResolver::new(tables)),
        };

        Ok(Self {
            executors,
            uploads: Arc::new(HttpUploadSource::new(client.clone(), uploads)),
            counter: Arc::new(HttpUploadCounter::new(client.clone(), uploads)),
            ownership: Arc::new(HttpOwnershipIndex::new(client.clone(), ownership)),
            scanner: Arc::new(HttpOwnershipScanner::new(client, ownership)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceEndpoints;

    #[test]
    fn test_wire_claims_normalise_space_shapes() {
        let wire: WireQuery = serde_json::from_str(
            r#"{"claims": [
                {"type": "index", "content": "bafyroot", "index": "bafyidx"},
                {"type": "location", "content": "bag1", "location": ["https://a/bag1.car"], "space": "did:key:s"},
                {"type": "location", "content": "bag2", "location": [], "space": {"did": "did:key:s"}},
                {"type": "location", "content": "bag3", "location": []},
                {"type": "equals", "content": "bag4"}
            ]}"#,
        )
        .unwrap();
        let query = content_query("bafyroot", wire);

        assert_eq!(query.index_id(), Some("bafyidx"));
        assert!(query.location_has_space("did:key:s"));
        assert_eq!(query.claims.len(), 5);
        assert!(matches!(
            &query.claims[2],
            Claim::Location { space: Some(SpaceIdentifier::Did(did)), .. } if did == "did:key:s"
        ));
        assert!(matches!(&query.claims[3], Claim::Location { space: None, .. }));
        assert!(matches!(&query.claims[4], Claim::Other { .. }));
    }

    #[test]
    fn test_gateway_grant_wire_shape() {
        let granted: GatewayGrant = serde_json::from_str(r#"{"result": "granted"}"#).unwrap();
        assert_eq!(granted, GatewayGrant::Granted);
        let skipped: GatewayGrant =
            serde_json::from_str(r#"{"result": "skipped", "reason": "no-delegation-found"}"#)
                .unwrap();
        assert!(matches!(skipped, GatewayGrant::Skipped { .. }));
    }

    #[test]
    fn test_from_settings_requires_every_endpoint() {
        let mut settings = MigrationSettings::default();
        assert!(matches!(
            RemoteServices::from_settings(&settings),
            Err(MigrationError::Config { .. })
        ));

        let base = Some("https://svc.example".to_string());
        settings.endpoints = ServiceEndpoints {
            uploads: base.clone(),
            indexing: base.clone(),
            index_worker: base.clone(),
            blobs: base.clone(),
            claims: base.clone(),
            gateway: base.clone(),
            ownership: base.clone(),
            sizes: base.clone(),
            advertisements: base,
            auth_token: None,
        };
        assert!(RemoteServices::from_settings(&settings).is_ok());
    }
}
