//! Background cache invalidation
//!
//! Each pass asks the store for registry documents changed since the last
//! successful pass — widened by one period to tolerate clock and commit
//! skew — and drops exactly those ids from the cache. When the scan itself
//! fails the whole cache is dropped instead and the watermark stays put,
//! so the next pass re-covers the same window: cold reloads are acceptable,
//! stale-deleted data is not.

use crate::cache::StorageCache;
use kvgrid_common::{CacheConfig, Result, StoreConfig, epoch_millis};
use kvgrid_store::{DocStore, SearchRequest, query, scan_all};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Periodic changed-document scanner feeding cache invalidation
pub struct CacheUpdater {
    store: Arc<dyn DocStore>,
    cache: Arc<StorageCache>,
    registry_index: String,
    period_ms: i64,
    scroll_keep_alive_ms: u64,
    page_size: usize,
    watermark_ms: Mutex<Option<i64>>,
}

impl CacheUpdater {
    /// Create an updater for the given cache
    pub fn new(
        store: Arc<dyn DocStore>,
        cache: Arc<StorageCache>,
        store_config: &StoreConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry_index: store_config.registry_index.clone(),
            period_ms: i64::try_from(cache_config.invalidation_period_secs)
                .unwrap_or(i64::MAX / 2)
                .saturating_mul(1_000),
            scroll_keep_alive_ms: store_config.scroll_keep_alive_ms,
            page_size: store_config.scroll_page_size,
            watermark_ms: Mutex::new(None),
        }
    }

    /// Watermark of the last successful pass, if any
    pub fn watermark(&self) -> Option<i64> {
        *self.watermark_ms.lock()
    }

    /// One invalidation pass
    pub async fn run_once(&self) {
        let started = epoch_millis();
        let base = self.watermark_ms.lock().unwrap_or(started);
        let since = base - self.period_ms;

        match self.changed_ids(since).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    debug!(count = ids.len(), "invalidating remotely changed storages");
                    self.cache.invalidate(&ids);
                }
                *self.watermark_ms.lock() = Some(started);
            }
            Err(e) => {
                warn!(error = %e, "changed-document scan failed, invalidating entire cache");
                self.cache.invalidate_all();
            }
        }
    }

    /// Run [`Self::run_once`] forever on the configured period
    pub async fn run_loop(self: Arc<Self>) {
        #[allow(clippy::cast_sign_loss)]
        let period = std::time::Duration::from_millis(self.period_ms.max(1_000) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    async fn changed_ids(&self, since_ms: i64) -> Result<Vec<String>> {
        let req = SearchRequest::scroll(
            self.registry_index.clone(),
            query::range_gte("last_updated", since_ms),
            self.scroll_keep_alive_ms,
            self.page_size,
        )
        .with_fields(Vec::new());

        let docs = scan_all(self.store.as_ref(), &req).await?;
        Ok(docs.into_iter().map(|doc| doc.id).collect())
    }
}
