//! In-memory collaborators shared by the integration tests.
//!
//! [`FakeWorld`] plays every remote service at once against one shared state,
//! so a test can seed the remote world, run the engine, and inspect what was
//! called and what is now visible.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use upload_migrator::collaborators::{
    AdvertisementQueue, BlobStore, ClaimPublisher, GatewayAuthorizer, GatewayGrant,
    IndexArtifact, IndexBuilder, IndexRegistrar, IndexingOracle, LocationClaim, Ownership,
    OwnershipIndex, OwnershipPage, OwnershipScanner, SizeResolver, StepExecutors, UploadCounter,
    UploadPage, UploadSource, NO_DELEGATION_FOUND,
};
use upload_migrator::orchestrator::RunOptions;
use upload_migrator::retry::RetryConfig;
use upload_migrator::types::{Claim, ContentQuery, SpaceIdentifier, UploadRecord};
use upload_migrator::{MigrationError, Result};

/// Remote operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Build,
    Put,
    Publish,
    Register,
    Advertise,
    Grant,
    Size,
}

#[derive(Default)]
pub struct WorldState {
    /// root → index id
    pub index_claims: HashMap<String, String>,
    /// content → one entry per location claim, with the space it carries
    pub location_claims: HashMap<String, Vec<Option<String>>>,
    pub sizes: HashMap<String, u64>,
    /// space → uploads, in listing order
    pub uploads: BTreeMap<String, Vec<UploadRecord>>,
    /// space → customer
    pub owners: BTreeMap<String, String>,
    pub no_delegation: HashSet<String>,
    pub faults: HashSet<Fault>,
    /// Faults limited to one space.
    pub space_faults: HashSet<(String, Fault)>,
    /// Indexing service answers 500.
    pub outage: bool,
    /// Published location claims are accepted but never become visible.
    pub hide_publications: bool,
    /// Every mutating call, in order.
    pub mutations: Vec<String>,
    pub queries: u64,
    /// space → number of list_uploads calls
    pub list_calls: HashMap<String, u64>,
    pub count_calls: u64,
}

#[derive(Clone, Default)]
pub struct FakeWorld(pub Arc<Mutex<WorldState>>);

impl FakeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, WorldState> {
        self.0.lock().unwrap()
    }

    pub fn executors(&self) -> StepExecutors {
        StepExecutors {
            oracle: Arc::new(self.clone()),
            index_builder: Arc::new(self.clone()),
            blobs: Arc::new(self.clone()),
            claims: Arc::new(self.clone()),
            registrar: Arc::new(self.clone()),
            advertisements: Arc::new(self.clone()),
            gateway: Arc::new(self.clone()),
            sizes: Arc::new(self.clone()),
        }
    }

    pub fn mutation_count(&self) -> usize {
        self.state().mutations.len()
    }

    pub fn list_calls(&self, space: &str) -> u64 {
        self.state().list_calls.get(space).copied().unwrap_or(0)
    }

    pub fn fail(&self, fault: Fault) {
        self.state().faults.insert(fault);
    }

    pub fn fail_in_space(&self, space: &str, fault: Fault) {
        self.state().space_faults.insert((space.to_string(), fault));
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.faults.clear();
        state.space_faults.clear();
    }

    /// An upload stored the legacy way: shard location claims without a space,
    /// no index claim.
    pub fn seed_legacy(&self, upload: &UploadRecord) {
        let mut state = self.state();
        for shard in &upload.shards {
            state
                .location_claims
                .entry(shard.clone())
                .or_default()
                .push(None);
            state.sizes.insert(shard.clone(), 1024);
        }
        state
            .uploads
            .entry(upload.space.clone())
            .or_default()
            .push(upload.clone());
    }

    /// An upload that needs nothing.
    pub fn seed_migrated(&self, upload: &UploadRecord) {
        let mut state = self.state();
        state
            .index_claims
            .insert(upload.root.clone(), format!("idx-{}", upload.root));
        for shard in &upload.shards {
            state
                .location_claims
                .entry(shard.clone())
                .or_default()
                .push(Some(upload.space.clone()));
            state.sizes.insert(shard.clone(), 1024);
        }
        state
            .uploads
            .entry(upload.space.clone())
            .or_default()
            .push(upload.clone());
    }

    /// Seed `count` legacy uploads into `space`, owned by `customer`.
    pub fn seed_space(&self, customer: &str, space: &str, count: usize) -> Vec<UploadRecord> {
        self.state()
            .owners
            .insert(space.to_string(), customer.to_string());
        (0..count)
            .map(|i| {
                let upload = upload(space, &format!("{}-root{:03}", space, i), 2);
                self.seed_legacy(&upload);
                upload
            })
            .collect()
    }

    fn check(&self, fault: Fault, space: Option<&str>) -> Result<()> {
        let state = self.state();
        let scoped = space
            .map(|s| state.space_faults.contains(&(s.to_string(), fault)))
            .unwrap_or(false);
        if state.faults.contains(&fault) || scoped {
            return Err(MigrationError::collaborator(
                format!("{:?}", fault),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.state().mutations.push(call);
    }
}

/// Build an upload with `shards` shard ids derived from `root`.
pub fn upload(space: &str, root: &str, shards: usize) -> UploadRecord {
    UploadRecord {
        space: space.to_string(),
        root: root.to_string(),
        shards: (0..shards).map(|i| format!("{}-shard{}", root, i)).collect(),
        inserted_at: None,
    }
}

/// Run options without delays, for tests.
pub fn fast_options() -> RunOptions {
    RunOptions {
        worker_id: "worker-test".to_string(),
        checkpoint_every: 3,
        upload_delay: Duration::ZERO,
        page_size: 4,
        limit: None,
        retry_failed: false,
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_base_delay(Duration::from_millis(1))
        .with_jitter(false)
}

#[async_trait]
impl IndexingOracle for FakeWorld {
    async fn query(&self, content: &str) -> Result<ContentQuery> {
        let mut state = self.state();
        if state.outage {
            return Err(MigrationError::IndexingService {
                status: 500,
                message: "internal error".to_string(),
            });
        }
        state.queries += 1;

        let mut claims = Vec::new();
        if let Some(index) = state.index_claims.get(content) {
            claims.push(Claim::Index {
                content: content.to_string(),
                index: index.clone(),
            });
        }
        for space in state.location_claims.get(content).into_iter().flatten() {
            claims.push(Claim::Location {
                content: content.to_string(),
                location: vec![format!("https://carpark.example/{}", content)],
                space: space.clone().map(SpaceIdentifier::Did),
            });
        }
        Ok(ContentQuery {
            content: content.to_string(),
            claims,
        })
    }
}

#[async_trait]
impl IndexBuilder for FakeWorld {
    async fn build(&self, space: &str, root: &str, shards: &[String]) -> Result<IndexArtifact> {
        self.check(Fault::Build, Some(space))?;
        self.record(format!("build {}", root));
        Ok(IndexArtifact {
            content_id: format!("idx-{}", root),
            bytes: Bytes::from(shards.join(",")),
        })
    }
}

#[async_trait]
impl BlobStore for FakeWorld {
    async fn put(&self, space: &str, artifact: &IndexArtifact) -> Result<String> {
        self.check(Fault::Put, Some(space))?;
        self.record(format!("put {}", artifact.content_id));
        Ok(format!("https://blobs.example/{}/{}", space, artifact.content_id))
    }
}

#[async_trait]
impl ClaimPublisher for FakeWorld {
    async fn publish_location(&self, claim: &LocationClaim) -> Result<()> {
        self.check(Fault::Publish, Some(&claim.space))?;
        self.record(format!("publish {}", claim.content));
        let mut state = self.state();
        if !state.hide_publications {
            state
                .location_claims
                .entry(claim.content.clone())
                .or_default()
                .push(Some(claim.space.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexRegistrar for FakeWorld {
    async fn register_index(&self, space: &str, root: &str, index: &str) -> Result<()> {
        self.check(Fault::Register, Some(space))?;
        self.record(format!("register {}", root));
        self.state()
            .index_claims
            .insert(root.to_string(), index.to_string());
        Ok(())
    }
}

#[async_trait]
impl AdvertisementQueue for FakeWorld {
    async fn enqueue(&self, shard: &str, _location: &str) -> Result<()> {
        self.check(Fault::Advertise, None)?;
        self.record(format!("advertise {}", shard));
        Ok(())
    }
}

#[async_trait]
impl GatewayAuthorizer for FakeWorld {
    async fn grant(&self, space: &str) -> Result<GatewayGrant> {
        self.check(Fault::Grant, Some(space))?;
        if self.state().no_delegation.contains(space) {
            return Ok(GatewayGrant::Skipped {
                reason: NO_DELEGATION_FOUND.to_string(),
            });
        }
        self.record(format!("grant {}", space));
        Ok(GatewayGrant::Granted)
    }
}

#[async_trait]
impl SizeResolver for FakeWorld {
    async fn resolve(&self, space: &str, shard: &str) -> Result<u64> {
        self.check(Fault::Size, Some(space))?;
        self.state()
            .sizes
            .get(shard)
            .copied()
            .ok_or_else(|| MigrationError::NotFound {
                kind: "shard size",
                id: shard.to_string(),
            })
    }
}

#[async_trait]
impl UploadSource for FakeWorld {
    async fn list_uploads(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<UploadPage> {
        let mut state = self.state();
        *state.list_calls.entry(space.to_string()).or_insert(0) += 1;

        let all = state.uploads.get(space).cloned().unwrap_or_default();
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (start + limit).min(all.len());
        Ok(UploadPage {
            uploads: all[start.min(end)..end].to_vec(),
            cursor: (end < all.len()).then(|| end.to_string()),
        })
    }
}

#[async_trait]
impl OwnershipIndex for FakeWorld {
    async fn customer_of(&self, space: &str) -> Result<Option<String>> {
        Ok(self.state().owners.get(space).cloned())
    }
}

#[async_trait]
impl OwnershipScanner for FakeWorld {
    async fn scan_segment(
        &self,
        segment: u32,
        total_segments: u32,
        _cursor: Option<&str>,
    ) -> Result<OwnershipPage> {
        let entries = self
            .state()
            .owners
            .iter()
            .enumerate()
            .filter(|(i, _)| *i as u32 % total_segments == segment)
            .map(|(_, (space, customer))| Ownership {
                space: space.clone(),
                customer: customer.clone(),
            })
            .collect();
        Ok(OwnershipPage {
            entries,
            cursor: None,
        })
    }
}

#[async_trait]
impl UploadCounter for FakeWorld {
    async fn count_uploads(&self, space: &str) -> Result<u64> {
        let mut state = self.state();
        state.count_calls += 1;
        Ok(state.uploads.get(space).map(|u| u.len() as u64).unwrap_or(0))
    }
}
