//! INDEX_GENERATION: build, store, claim, and register a sharded index.

use tracing::info;

use crate::collaborators::{LocationClaim, StepExecutors};
use crate::error::{MigrationError, Result};
use crate::types::UploadRecord;

/// Where a freshly generated index ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedIndex {
    pub index_id: String,
    pub location: String,
    pub size: u64,
}

fn sub_step(name: &str, err: MigrationError) -> MigrationError {
    // Outages keep their type so they are classified as skips, not failures.
    if err.is_indexing_outage() {
        return err;
    }
    MigrationError::collaborator(name, err)
}

/// Generate and register the index for `upload`.
///
/// The artifact's own location claim must be published before registration,
/// because the indexing service fetches the index through it.
pub async fn generate_index(executors: &StepExecutors, upload: &UploadRecord) -> Result<PublishedIndex> {
    let artifact = executors
        .index_builder
        .build(&upload.space, &upload.root, &upload.shards)
        .await
        .map_err(|e| sub_step("build index", e))?;

    let location = executors
        .blobs
        .put(&upload.space, &artifact)
        .await
        .map_err(|e| sub_step("upload index", e))?;

    let claim = LocationClaim {
        space: upload.space.clone(),
        content: artifact.content_id.clone(),
        size: artifact.size(),
        location: location.clone(),
    };
    executors
        .claims
        .publish_location(&claim)
        .await
        .map_err(|e| sub_step("publish index location claim", e))?;

    executors
        .registrar
        .register_index(&upload.space, &upload.root, &artifact.content_id)
        .await
        .map_err(|e| sub_step("register index", e))?;

    info!(
        "Registered index {} ({} bytes) for {}",
        artifact.content_id,
        artifact.size(),
        upload.root
    );

    Ok(PublishedIndex {
        index_id: artifact.content_id,
        location,
        size: claim.size,
    })
}
