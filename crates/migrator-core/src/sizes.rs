//! Shard size resolution across several backing tables.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::collaborators::{SizeResolver, SizeTable};
use crate::error::{MigrationError, Result};
use crate::retry::{retry_transient, RetryConfig};

/// Looks a shard up in each table in turn, oldest first; the first table holding
/// a record wins. Each lookup is a point query with bounded retry.
pub struct TieredSizeResolver {
    tables: Vec<Arc<dyn SizeTable>>,
    retry: RetryConfig,
}

impl TieredSizeResolver {
    /// `tables` in lookup order, oldest first.
    pub fn new(tables: Vec<Arc<dyn SizeTable>>) -> Self {
        Self {
            tables,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl SizeResolver for TieredSizeResolver {
    async fn resolve(&self, space: &str, shard: &str) -> Result<u64> {
        for table in &self.tables {
            let found = retry_transient(&self.retry, "shard size lookup", || async move {
                table.lookup(space, shard).await
            })
            .await?;
            if let Some(size) = found {
                debug!("Resolved size of {} from {}: {}", shard, table.name(), size);
                return Ok(size);
            }
        }
        Err(MigrationError::NotFound {
            kind: "shard size",
            id: shard.to_string(),
        })
    }
}
