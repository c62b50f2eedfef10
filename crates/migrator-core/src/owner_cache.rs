//! Read-through cache for space ownership lookups.
//!
//! One instance is built per run and handed to whoever needs `space → customer`.
//! Only positive answers are cached; an unknown space is asked again next time.

use mini_moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::collaborators::OwnershipIndex;
use crate::config::ProgressDefaults;
use crate::error::Result;

pub struct OwnerCache {
    index: Arc<dyn OwnershipIndex>,
    cache: Cache<String, String>,
}

impl OwnerCache {
    /// A cache with the default TTL and capacity.
    pub fn new(index: Arc<dyn OwnershipIndex>) -> Self {
        Self::with_ttl(
            index,
            ProgressDefaults::OWNER_CACHE_TTL,
            ProgressDefaults::OWNER_CACHE_CAPACITY,
        )
    }

    pub fn with_ttl(index: Arc<dyn OwnershipIndex>, ttl: Duration, capacity: u64) -> Self {
        Self {
            index,
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
        }
    }

    /// The customer owning `space`, from cache or the ownership index.
    pub async fn customer_of(&self, space: &str) -> Result<Option<String>> {
        let key = space.to_string();
        if let Some(customer) = self.cache.get(&key) {
            return Ok(Some(customer));
        }

        let customer = self.index.customer_of(space).await?;
        if let Some(ref customer) = customer {
            debug!("Cached owner of {}: {}", space, customer);
            self.cache.insert(key, customer.clone());
        }
        Ok(customer)
    }
}
