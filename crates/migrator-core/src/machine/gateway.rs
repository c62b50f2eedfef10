//! GATEWAY_AUTH: best-effort grant of gateway serving rights for a space.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collaborators::{GatewayAuthorizer, GatewayGrant, NO_DELEGATION_FOUND};

/// Result of the gateway authorization step.
///
/// A missing delegation chain is an expected condition, so it is a variant here
/// rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GatewayAuthOutcome {
    Granted,
    Skipped { reason: String },
    Failed { message: String },
}

impl GatewayAuthOutcome {
    pub fn success(&self) -> bool {
        matches!(self, GatewayAuthOutcome::Granted)
    }

    pub fn skipped(&self) -> bool {
        matches!(self, GatewayAuthOutcome::Skipped { .. })
    }

    /// Skipped because the space has granted no delegation to the gateway.
    pub fn is_missing_delegation(&self) -> bool {
        matches!(self, GatewayAuthOutcome::Skipped { reason } if reason == NO_DELEGATION_FOUND)
    }
}

/// Ask the authorizer for a grant. Every call creates a new delegation record;
/// no check for an existing one is made.
pub async fn authorize_gateway(gateway: &dyn GatewayAuthorizer, space: &str) -> GatewayAuthOutcome {
    match gateway.grant(space).await {
        Ok(GatewayGrant::Granted) => GatewayAuthOutcome::Granted,
        Ok(GatewayGrant::Skipped { reason }) => {
            warn!("Gateway authorization skipped for {}: {}", space, reason);
            GatewayAuthOutcome::Skipped { reason }
        }
        Err(e) => GatewayAuthOutcome::Failed {
            message: e.to_string(),
        },
    }
}
