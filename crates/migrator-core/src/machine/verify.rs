//! VERIFY: re-query remote state independently of what the steps reported.

use serde::{Deserialize, Serialize};

use super::gateway::GatewayAuthOutcome;
use crate::collaborators::IndexingOracle;
use crate::error::Result;
use crate::types::UploadRecord;

/// What re-verification found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub index_present: bool,
    /// Shards with no location claim at all.
    pub shards_without_location: Vec<String>,
    /// Shards whose location claims all lack the upload's space.
    pub shards_without_space: Vec<String>,
    pub gateway_required: bool,
    pub gateway_ok: bool,
    pub gateway_skipped: bool,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.index_present
            && self.shards_without_location.is_empty()
            && self.shards_without_space.is_empty()
            && self.gateway_ok
    }
}

/// How the gateway step should be judged.
#[derive(Debug, Clone, Copy)]
pub struct GatewayExpectation<'a> {
    /// Outcome of this run's gateway step, `None` if it did not run.
    pub outcome: Option<&'a GatewayAuthOutcome>,
    /// A skip counts as a failure.
    pub required: bool,
    /// Verification runs on its own; gateway state is not checked.
    pub isolated: bool,
}

pub async fn verify_upload(
    oracle: &dyn IndexingOracle,
    upload: &UploadRecord,
    gateway: GatewayExpectation<'_>,
) -> Result<VerificationReport> {
    let root = oracle.query(&upload.root).await?;
    let index_present = root.has_index_claim();

    let mut shards_without_location = Vec::new();
    let mut shards_without_space = Vec::new();
    for shard in &upload.shards {
        let claims = oracle.query(shard).await?;
        if !claims.has_location_claim() {
            shards_without_location.push(shard.clone());
        } else if !claims.location_has_space(&upload.space) {
            shards_without_space.push(shard.clone());
        }
    }

    let gateway_skipped = gateway.outcome.is_some_and(GatewayAuthOutcome::skipped);
    let gateway_ok = if gateway.isolated {
        true
    } else {
        match gateway.outcome {
            None | Some(GatewayAuthOutcome::Granted) => true,
            Some(GatewayAuthOutcome::Skipped { .. }) => !gateway.required,
            Some(GatewayAuthOutcome::Failed { .. }) => false,
        }
    };

    Ok(VerificationReport {
        index_present,
        shards_without_location,
        shards_without_space,
        gateway_required: gateway.required && !gateway.isolated,
        gateway_ok,
        gateway_skipped,
    })
}
