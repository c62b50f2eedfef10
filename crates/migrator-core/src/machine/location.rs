//! LOCATION_CLAIMS: republish shard location claims that carry the space.

use tracing::debug;

use crate::collaborators::{LocationClaim, StepExecutors};
use crate::error::{MigrationError, Result};
use crate::types::UploadRecord;

/// Publish a space-carrying location claim for each of `shards` and queue it
/// for advertisement. The first failure aborts the step.
///
/// Old claims without the space are left in place; claims are append-only.
pub async fn publish_location_claims(
    executors: &StepExecutors,
    upload: &UploadRecord,
    shards: &[String],
    location_for: impl Fn(&str) -> String,
) -> Result<u64> {
    let mut published = 0;

    for shard in shards {
        let size = executors
            .sizes
            .resolve(&upload.space, shard)
            .await
            .map_err(|e| MigrationError::collaborator(format!("resolve size of {}", shard), e))?;

        let location = location_for(shard);
        let claim = LocationClaim {
            space: upload.space.clone(),
            content: shard.clone(),
            size,
            location: location.clone(),
        };

        executors
            .claims
            .publish_location(&claim)
            .await
            .map_err(|e| MigrationError::collaborator(format!("publish claim for {}", shard), e))?;

        executors
            .advertisements
            .enqueue(shard, &location)
            .await
            .map_err(|e| MigrationError::collaborator(format!("advertise {}", shard), e))?;

        debug!("Published location claim for {} ({} bytes)", shard, size);
        published += 1;
    }

    Ok(published)
}
