//! ANALYZE: derive an upload's [`MigrationStatus`] from the indexing service.

use tracing::debug;

use crate::collaborators::IndexingOracle;
use crate::error::Result;
use crate::types::{MigrationStatus, UploadRecord};

/// Query the root and every shard, and work out which steps are still needed.
///
/// Read-only. An upload without shards trivially satisfies the location checks.
pub async fn analyze(oracle: &dyn IndexingOracle, upload: &UploadRecord) -> Result<MigrationStatus> {
    let root = oracle.query(&upload.root).await?;
    let has_index_claim = root.has_index_claim();

    let mut has_location_claim = true;
    let mut shards_needing_location_claims: Vec<String> = Vec::new();
    for shard in &upload.shards {
        let claims = oracle.query(shard).await?;
        if !claims.has_location_claim() {
            has_location_claim = false;
        }
        if !claims.location_has_space(&upload.space) && !shards_needing_location_claims.contains(shard)
        {
            shards_needing_location_claims.push(shard.clone());
        }
    }

    let location_has_space = shards_needing_location_claims.is_empty();
    let needs_index_generation = !has_index_claim;
    let needs_location_claims = !location_has_space;

    let status = MigrationStatus {
        has_index_claim,
        has_location_claim,
        location_has_space,
        shards_needing_location_claims,
        needs_index_generation,
        needs_location_claims,
        // No way to read grant state back, so re-grant whenever anything else moved.
        needs_gateway_auth: needs_index_generation || needs_location_claims,
    };

    debug!(
        "Analyzed {}: index={}, location={}, space={}, {} shards need claims",
        upload.root,
        status.has_index_claim,
        status.has_location_claim,
        status.location_has_space,
        status.shards_needing_location_claims.len()
    );

    Ok(status)
}
