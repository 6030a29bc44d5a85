//! Storage metadata cache
//!
//! Size- and time-bounded view of the registry index. Entries map a
//! storage id to its record, or to a remembered absence so repeated reads
//! of nonexistent ids stay off the store. Loads go through per-key gates:
//! at most one flight per key, late arrivals wait for the winner's result.
//! Authorization is re-evaluated on every read, hit or miss — ownership
//! changes independently of the storage documents, so existence and
//! permission are never cached.
//!
//! A sweep pass drops idle entries, reloads aged ones and evicts
//! least-recently-used entries past the size bound. The companion
//! [`crate::CacheUpdater`] invalidates entries whose documents changed
//! remotely.

use crate::access::{AccessResolver, Caller};
use crate::record::{StorageKind, StorageRecord};
use dashmap::DashMap;
use kvgrid_common::{CacheConfig, Error, Result};
use kvgrid_store::DocStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

struct CacheEntry {
    value: Option<StorageRecord>,
    loaded_at: Instant,
    last_access: Instant,
}

impl CacheEntry {
    fn new(value: Option<StorageRecord>) -> Self {
        let now = Instant::now();
        Self {
            value,
            loaded_at: now,
            last_access: now,
        }
    }
}

enum OwnerRef {
    Vm(String),
    Account(String),
}

/// Concurrent storage metadata cache with single-flight loading
pub struct StorageCache {
    store: Arc<dyn DocStore>,
    resolver: Arc<dyn AccessResolver>,
    registry_index: String,
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    loads: DashMap<String, Arc<AsyncMutex<()>>>,
    loader_calls: AtomicU64,
}

impl StorageCache {
    /// Create a cache over the given store and resolver
    pub fn new(
        store: Arc<dyn DocStore>,
        resolver: Arc<dyn AccessResolver>,
        registry_index: impl Into<String>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            registry_index: registry_index.into(),
            config,
            entries: DashMap::new(),
            loads: DashMap::new(),
            loader_calls: AtomicU64::new(0),
        }
    }

    /// Read one storage record as the given caller
    ///
    /// Loads through the store on a miss (negative results included),
    /// then applies the kind-appropriate access check: soft-deleted
    /// records and records whose owner no longer exists read as absent;
    /// an existing owner the caller may not act for is an access error.
    /// Corrupt documents fail the read with an integrity error.
    pub async fn get(&self, caller: &Caller, id: &str) -> Result<Option<StorageRecord>> {
        let cached = match self.lookup(id) {
            Some(value) => value,
            None => self.load(id).await?,
        };
        self.authorize(caller, cached).await
    }

    /// Drop the given ids from the cache
    pub fn invalidate(&self, ids: &[String]) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    /// Drop everything
    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of loads issued against the store so far
    pub fn loader_calls(&self) -> u64 {
        self.loader_calls.load(Ordering::Relaxed)
    }

    /// One maintenance pass: drop idle entries, reload aged ones, evict
    /// least-recently-used entries beyond the size bound
    pub async fn sweep(&self) {
        let now = Instant::now();

        let idle_bound = self.config.expire_after_access();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_access) < idle_bound);

        let refresh_age = self.config.refresh_after_write();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.loaded_at) >= refresh_age)
            .map(|entry| entry.key().clone())
            .collect();
        for id in due {
            self.refresh(&id).await;
        }

        let excess = self.entries.len().saturating_sub(self.config.max_entries);
        if excess > 0 {
            let mut by_access: Vec<(String, Instant)> = self
                .entries
                .iter()
                .map(|entry| (entry.key().clone(), entry.last_access))
                .collect();
            by_access.sort_by_key(|(_, at)| *at);
            for (id, _) in by_access.into_iter().take(excess) {
                self.entries.remove(&id);
            }
        }
    }

    /// Run [`Self::sweep`] forever on the configured period
    pub async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    fn lookup(&self, id: &str) -> Option<Option<StorageRecord>> {
        self.entries.get_mut(id).map(|mut entry| {
            entry.last_access = Instant::now();
            entry.value.clone()
        })
    }

    async fn load(&self, id: &str) -> Result<Option<StorageRecord>> {
        let gate = self.loads.entry(id.to_string()).or_default().clone();
        let guard = gate.lock().await;

        // The flight we waited behind may have filled the entry.
        if let Some(value) = self.lookup(id) {
            return Ok(value);
        }

        let result = self.fetch(id).await;
        if let Ok(value) = &result {
            self.entries.insert(id.to_string(), CacheEntry::new(value.clone()));
        }

        drop(guard);
        self.loads.remove(id);
        result
    }

    async fn refresh(&self, id: &str) {
        let gate = self.loads.entry(id.to_string()).or_default().clone();
        let guard = gate.lock().await;

        match self.fetch(id).await {
            Ok(value) => {
                // Keep the old access time so a refresh does not defeat
                // idle expiry.
                let last_access = self
                    .entries
                    .get(id)
                    .map_or_else(Instant::now, |entry| entry.last_access);
                self.entries.insert(
                    id.to_string(),
                    CacheEntry {
                        value,
                        loaded_at: Instant::now(),
                        last_access,
                    },
                );
            }
            Err(e) => warn!(id, error = %e, "cache refresh failed, keeping cached value"),
        }

        drop(guard);
        self.loads.remove(id);
    }

    async fn fetch(&self, id: &str) -> Result<Option<StorageRecord>> {
        self.loader_calls.fetch_add(1, Ordering::Relaxed);
        match self.store.get(&self.registry_index, id).await? {
            None => Ok(None),
            Some(doc) => StorageRecord::from_store_doc(doc).map(Some),
        }
    }

    async fn authorize(
        &self,
        caller: &Caller,
        record: Option<StorageRecord>,
    ) -> Result<Option<StorageRecord>> {
        let Some(record) = record else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }

        let owner = match &record.kind {
            StorageKind::Temp { .. } => None,
            StorageKind::Vm { vm_id } => Some(OwnerRef::Vm(vm_id.clone())),
            StorageKind::Account { owner, .. } => Some(OwnerRef::Account(owner.clone())),
        };

        match owner {
            None => Ok(Some(record)),
            Some(OwnerRef::Vm(vm_id)) => {
                if !self.resolver.vm_exists(&vm_id).await? {
                    return Ok(None);
                }
                if !self.resolver.can_access_vm(caller, &vm_id).await? {
                    return Err(Error::AccessDenied(record.id));
                }
                Ok(Some(record))
            }
            Some(OwnerRef::Account(account)) => {
                if !self.resolver.account_exists(&account).await? {
                    return Ok(None);
                }
                if !self.resolver.can_access_account(caller, &account).await? {
                    return Err(Error::AccessDenied(record.id));
                }
                Ok(Some(record))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticResolver;
    use kvgrid_common::epoch_millis;
    use kvgrid_store::MemoryDocStore;
    use serde_json::json;
    use std::time::Duration;

    const REGISTRY: &str = "registry";

    fn wide_open_config() -> CacheConfig {
        CacheConfig {
            max_entries: 100,
            expire_after_access_secs: 600,
            refresh_after_write_secs: 600,
            ..CacheConfig::default()
        }
    }

    fn build(config: CacheConfig) -> (Arc<MemoryDocStore>, Arc<StaticResolver>, StorageCache) {
        let store = Arc::new(MemoryDocStore::new());
        let resolver = Arc::new(StaticResolver::new());
        let cache = StorageCache::new(store.clone(), resolver.clone(), REGISTRY, config);
        (store, resolver, cache)
    }

    fn temp_record(id: &str) -> StorageRecord {
        StorageRecord {
            id: id.to_string(),
            kind: StorageKind::Temp {
                ttl_ms: 60_000,
                expires_at_ms: epoch_millis() + 60_000,
            },
            name: None,
            history_enabled: false,
            deleted: false,
            last_updated_ms: epoch_millis(),
        }
    }

    fn account_record(id: &str, owner: &str) -> StorageRecord {
        StorageRecord {
            id: id.to_string(),
            kind: StorageKind::Account {
                owner: owner.to_string(),
                description: None,
            },
            name: Some("primary".to_string()),
            history_enabled: true,
            deleted: false,
            last_updated_ms: epoch_millis(),
        }
    }

    async fn seed(store: &MemoryDocStore, record: &StorageRecord) {
        store
            .put(REGISTRY, &record.id, &record.to_value().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hit_does_not_reload() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");
        seed(&store, &temp_record("s-1")).await;

        assert!(cache.get(&caller, "s-1").await.unwrap().is_some());
        assert_eq!(store.get_calls(), 1);

        for _ in 0..5 {
            assert!(cache.get(&caller, "s-1").await.unwrap().is_some());
        }
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_negative_result_is_cached() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");

        assert!(cache.get(&caller, "ghost").await.unwrap().is_none());
        assert!(cache.get(&caller, "ghost").await.unwrap().is_none());
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_single_flight_load_per_key() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");
        seed(&store, &temp_record("s-1")).await;
        store.set_get_delay(Some(Duration::from_millis(20)));

        let reads = futures::future::join_all(
            (0..10).map(|_| cache.get(&caller, "s-1")),
        )
        .await;
        for read in reads {
            assert!(read.unwrap().is_some());
        }
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_is_targeted() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");
        seed(&store, &temp_record("s-1")).await;
        seed(&store, &temp_record("s-2")).await;

        cache.get(&caller, "s-1").await.unwrap();
        cache.get(&caller, "s-2").await.unwrap();
        assert_eq!(store.get_calls(), 2);

        cache.invalidate(&["s-1".to_string()]);

        cache.get(&caller, "s-2").await.unwrap();
        assert_eq!(store.get_calls(), 2);

        cache.get(&caller, "s-1").await.unwrap();
        assert_eq!(store.get_calls(), 3);
    }

    #[tokio::test]
    async fn test_load_error_surfaces_and_is_not_cached() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");
        seed(&store, &temp_record("s-1")).await;

        store.set_failing("get", true);
        assert!(cache.get(&caller, "s-1").await.unwrap_err().is_transient());

        store.set_failing("get", false);
        assert!(cache.get(&caller, "s-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_integrity_error() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");

        store
            .put(REGISTRY, "bad", &json!({"kind": "TEMP", "ttl": 1, "expires_at": 2}))
            .await
            .unwrap();
        let err = cache.get(&caller, "bad").await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "deleted", .. }));

        store.put(REGISTRY, "worse", &json!({"deleted": false})).await.unwrap();
        let err = cache.get(&caller, "worse").await.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { field: "kind", .. }));
    }

    #[tokio::test]
    async fn test_account_access_checks() {
        let (store, resolver, cache) = build(wide_open_config());
        resolver.add_account("acct-1");
        seed(&store, &account_record("s-1", "acct-1")).await;

        let owner = Caller::new("acct-1");
        let stranger = Caller::new("acct-2");

        assert!(cache.get(&owner, "s-1").await.unwrap().is_some());
        assert!(matches!(
            cache.get(&stranger, "s-1").await.unwrap_err(),
            Error::AccessDenied(_)
        ));
    }

    #[tokio::test]
    async fn test_vanished_owner_reads_absent_even_when_cached() {
        let (store, resolver, cache) = build(wide_open_config());
        resolver.add_account("acct-1");
        seed(&store, &account_record("s-1", "acct-1")).await;

        let owner = Caller::new("acct-1");
        assert!(cache.get(&owner, "s-1").await.unwrap().is_some());

        resolver.remove_account("acct-1", epoch_millis());
        // Still cache-resident, but existence is re-validated per read.
        assert!(cache.get(&owner, "s-1").await.unwrap().is_none());
        assert_eq!(store.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_vm_access_checks() {
        let (store, resolver, cache) = build(wide_open_config());
        resolver.add_vm("vm-1", "acct-1");
        let record = StorageRecord {
            id: "s-vm".to_string(),
            kind: StorageKind::Vm { vm_id: "vm-1".to_string() },
            name: None,
            history_enabled: false,
            deleted: false,
            last_updated_ms: epoch_millis(),
        };
        seed(&store, &record).await;

        let owner = Caller::new("acct-1");
        let stranger = Caller::new("acct-2");
        assert!(cache.get(&owner, "s-vm").await.unwrap().is_some());
        assert!(matches!(
            cache.get(&stranger, "s-vm").await.unwrap_err(),
            Error::AccessDenied(_)
        ));

        resolver.remove_vm("vm-1");
        assert!(cache.get(&owner, "s-vm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_after_remote_delete_until_invalidated() {
        let (store, _, cache) = build(wide_open_config());
        let caller = Caller::new("anyone");
        let record = temp_record("s-1");
        seed(&store, &record).await;

        assert!(cache.get(&caller, "s-1").await.unwrap().is_some());

        // Soft-delete at the store behind the cache's back.
        let mut deleted = record.clone();
        deleted.deleted = true;
        seed(&store, &deleted).await;

        // Stale value keeps being served until the entry is invalidated.
        assert!(cache.get(&caller, "s-1").await.unwrap().is_some());

        cache.invalidate(&["s-1".to_string()]);
        assert!(cache.get(&caller, "s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_entries() {
        let config = CacheConfig {
            expire_after_access_secs: 0,
            refresh_after_write_secs: 600,
            ..wide_open_config()
        };
        let (store, _, cache) = build(config);
        let caller = Caller::new("anyone");
        seed(&store, &temp_record("s-1")).await;

        cache.get(&caller, "s-1").await.unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.sweep().await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_refreshes_aged_entries() {
        let config = CacheConfig {
            refresh_after_write_secs: 0,
            ..wide_open_config()
        };
        let (store, _, cache) = build(config);
        let caller = Caller::new("anyone");
        let record = temp_record("s-1");
        seed(&store, &record).await;

        cache.get(&caller, "s-1").await.unwrap();
        assert_eq!(store.get_calls(), 1);

        // Remote change is picked up by the refresh without an invalidate.
        let mut renamed = record;
        renamed.name = Some("fresh".to_string());
        seed(&store, &renamed).await;

        cache.sweep().await;
        assert_eq!(store.get_calls(), 2);

        let seen = cache.get(&caller, "s-1").await.unwrap().unwrap();
        assert_eq!(seen.name.as_deref(), Some("fresh"));
        assert_eq!(store.get_calls(), 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_least_recently_used() {
        let config = CacheConfig {
            max_entries: 2,
            ..wide_open_config()
        };
        let (store, _, cache) = build(config);
        let caller = Caller::new("anyone");
        for id in ["s-1", "s-2", "s-3"] {
            seed(&store, &temp_record(id)).await;
        }

        cache.get(&caller, "s-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.get(&caller, "s-2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.get(&caller, "s-3").await.unwrap();

        cache.sweep().await;
        assert_eq!(cache.len(), 2);

        // s-1 was the least recently used; touching it again reloads.
        let before = store.get_calls();
        cache.get(&caller, "s-1").await.unwrap();
        assert_eq!(store.get_calls(), before + 1);
    }
}
