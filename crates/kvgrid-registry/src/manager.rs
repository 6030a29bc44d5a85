//! Storage manager façade
//!
//! The surface the management API layer calls: storage creation per kind,
//! cache-backed reads, listings, mutations, history retrieval, value reads,
//! and the idempotent maintenance bodies the scheduled jobs run. No
//! algorithmic weight lives here — this module composes the cache, the
//! request layer and the access seam.

use crate::access::{AccessResolver, Caller};
use crate::cache::StorageCache;
use crate::record::{HistoryEntry, KIND_ACCOUNT, KIND_TEMP, KIND_VM, StorageKind, StorageRecord};
use kvgrid_common::{
    Config, Error, JobConfig, LimitConfig, PagedResult, Result, ScrollCursor, StoreConfig,
    epoch_millis,
};
use kvgrid_store::{Doc, DocStore, SearchRequest, ValueClient, query, scan_all};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Façade over the storage registry
pub struct StorageManager {
    store: Arc<dyn DocStore>,
    cache: Arc<StorageCache>,
    resolver: Arc<dyn AccessResolver>,
    values: Arc<ValueClient>,
    store_config: StoreConfig,
    job_config: JobConfig,
    limits: LimitConfig,
}

impl StorageManager {
    /// Wire the façade from its collaborators
    pub fn new(
        store: Arc<dyn DocStore>,
        cache: Arc<StorageCache>,
        resolver: Arc<dyn AccessResolver>,
        values: Arc<ValueClient>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            cache,
            resolver,
            values,
            store_config: config.store.clone(),
            job_config: config.jobs.clone(),
            limits: config.limits.clone(),
        }
    }

    // ---- Creation ----

    /// Create a named storage owned by the caller's account
    pub async fn create_account_storage(
        &self,
        caller: &Caller,
        name: &str,
        description: Option<String>,
        history_enabled: bool,
    ) -> Result<StorageRecord> {
        self.validate_name(name)?;
        self.validate_description(description.as_deref())?;

        let owner = caller.account_id.as_str();
        if !self.resolver.account_exists(owner).await? {
            return Err(Error::invalid_argument(format!("unknown account {owner}")));
        }

        // Name must be unique among the account's live storages.
        let dup = SearchRequest::offset(
            self.store_config.registry_index.clone(),
            query::bool_filter(vec![
                query::term("kind", KIND_ACCOUNT),
                query::term("account", owner),
                query::term("name", name),
                query::term("deleted", false),
            ]),
            0,
            1,
        );
        if self.store.search(&dup).await?.total > 0 {
            return Err(Error::StorageAlreadyExists(name.to_string()));
        }

        let mut record = StorageRecord {
            id: String::new(),
            kind: StorageKind::Account {
                owner: owner.to_string(),
                description,
            },
            name: Some(name.to_string()),
            history_enabled,
            deleted: false,
            last_updated_ms: epoch_millis(),
        };
        record.id = self
            .store
            .create(&self.store_config.registry_index, None, &record.to_value()?)
            .await?;
        debug!(storage = %record.id, account = owner, "created account storage");
        Ok(record)
    }

    /// Create the storage bound to a virtual machine
    ///
    /// The storage id is the machine id, so a second create for the same
    /// machine is a conflict rather than a duplicate namespace.
    pub async fn create_vm_storage(&self, vm_id: &str) -> Result<StorageRecord> {
        if !self.resolver.vm_exists(vm_id).await? {
            return Err(Error::invalid_argument(format!("unknown vm {vm_id}")));
        }

        let record = StorageRecord {
            id: vm_id.to_string(),
            kind: StorageKind::Vm {
                vm_id: vm_id.to_string(),
            },
            name: None,
            history_enabled: false,
            deleted: false,
            last_updated_ms: epoch_millis(),
        };
        self.store
            .create(
                &self.store_config.registry_index,
                Some(vm_id),
                &record.to_value()?,
            )
            .await?;
        debug!(storage = vm_id, "created vm storage");
        Ok(record)
    }

    /// Create an anonymous storage that expires after `ttl_ms`
    pub async fn create_temp_storage(&self, ttl_ms: i64) -> Result<StorageRecord> {
        if ttl_ms <= 0 {
            return Err(Error::invalid_argument("ttl must be positive"));
        }

        let now = epoch_millis();
        let mut record = StorageRecord {
            id: String::new(),
            kind: StorageKind::Temp {
                ttl_ms,
                expires_at_ms: now + ttl_ms,
            },
            name: None,
            history_enabled: false,
            deleted: false,
            last_updated_ms: now,
        };
        record.id = self
            .store
            .create(&self.store_config.registry_index, None, &record.to_value()?)
            .await?;
        debug!(storage = %record.id, ttl_ms, "created temp storage");
        Ok(record)
    }

    // ---- Reads ----

    /// Read one storage as the caller; absent, soft-deleted and
    /// owner-vanished storages all read as `None`
    pub async fn get_storage(&self, caller: &Caller, id: &str) -> Result<Option<StorageRecord>> {
        self.cache.get(caller, id).await
    }

    /// List an account's live storages, offset-paginated
    pub async fn list_account_storages(
        &self,
        caller: &Caller,
        owner: &str,
        from: usize,
        size: usize,
    ) -> Result<PagedResult<StorageRecord>> {
        if !self.resolver.account_exists(owner).await? {
            return Ok(PagedResult::finished(Vec::new(), 0));
        }
        if !self.resolver.can_access_account(caller, owner).await? {
            return Err(Error::AccessDenied(owner.to_string()));
        }

        let req = SearchRequest::offset(
            self.store_config.registry_index.clone(),
            query::bool_filter(vec![
                query::term("kind", KIND_ACCOUNT),
                query::term("account", owner),
                query::term("deleted", false),
            ]),
            from,
            size,
        );
        let page = self.store.search(&req).await?;
        let items = page
            .docs
            .into_iter()
            .map(StorageRecord::from_store_doc)
            .collect::<Result<Vec<_>>>()?;
        Ok(PagedResult::finished(items, page.total))
    }

    /// Read one value through the value backend
    pub async fn get_value(&self, caller: &Caller, id: &str, key: &str) -> Result<String> {
        self.require(caller, id).await?;
        self.values.get(id, key).await
    }

    /// First page of a storage's per-key history
    pub async fn history(
        &self,
        caller: &Caller,
        id: &str,
        page_size: usize,
    ) -> Result<PagedResult<HistoryEntry>> {
        let record = self.require(caller, id).await?;
        if !record.history_enabled {
            return Err(Error::invalid_argument(format!(
                "history is not enabled for storage {id}"
            )));
        }

        let req = SearchRequest::scroll(
            self.store_config.history_index(id),
            query::match_all(),
            self.store_config.scroll_keep_alive_ms,
            page_size,
        );
        let page = self.store.search(&req).await?;
        Self::history_page(page)
    }

    /// Continue a history traversal
    pub async fn history_next(&self, cursor: &ScrollCursor) -> Result<PagedResult<HistoryEntry>> {
        let page = self.store.scroll(cursor).await?;
        if page.docs.is_empty() {
            if let Some(open) = &page.cursor {
                let _ = self.store.clear_scroll(open).await;
            }
            return Ok(PagedResult::finished(Vec::new(), page.total));
        }
        Self::history_page(page)
    }

    // ---- Mutations ----

    /// Rename a storage
    pub async fn rename_storage(&self, caller: &Caller, id: &str, name: &str) -> Result<()> {
        self.validate_name(name)?;
        let mut record = self.require(caller, id).await?;
        record.name = Some(name.to_string());
        self.write_back(&mut record).await
    }

    /// Replace the description of an account storage
    pub async fn update_description(
        &self,
        caller: &Caller,
        id: &str,
        description: Option<String>,
    ) -> Result<()> {
        self.validate_description(description.as_deref())?;
        let mut record = self.require(caller, id).await?;
        let StorageKind::Account { owner, .. } = record.kind else {
            return Err(Error::invalid_argument(
                "only account storages carry a description",
            ));
        };
        record.kind = StorageKind::Account { owner, description };
        self.write_back(&mut record).await
    }

    /// Extend a temp storage's lifetime by a fresh TTL from now
    pub async fn renew_temp_storage(&self, caller: &Caller, id: &str, ttl_ms: i64) -> Result<()> {
        if ttl_ms <= 0 {
            return Err(Error::invalid_argument("ttl must be positive"));
        }
        let mut record = self.require(caller, id).await?;
        let StorageKind::Temp { .. } = record.kind else {
            return Err(Error::invalid_argument("only temp storages have a ttl"));
        };
        record.kind = StorageKind::Temp {
            ttl_ms,
            expires_at_ms: epoch_millis() + ttl_ms,
        };
        self.write_back(&mut record).await
    }

    /// Soft-delete a storage; a purge job removes the document and its
    /// data later
    pub async fn delete_storage(&self, caller: &Caller, id: &str) -> Result<()> {
        let mut record = self.require(caller, id).await?;
        record.deleted = true;
        self.write_back(&mut record).await
    }

    // ---- Maintenance job bodies ----

    /// Soft-delete TEMP storages whose TTL has lapsed
    pub async fn expire_temp_storages(&self) -> Result<usize> {
        let now = epoch_millis();
        let req = self.scroll_registry(query::bool_filter(vec![
            query::term("kind", KIND_TEMP),
            query::term("deleted", false),
            query::range_lte("expires_at", now),
        ]));

        let docs = scan_all(self.store.as_ref(), &req).await?;
        Ok(self.soft_delete_docs(docs, now).await)
    }

    /// Remove soft-deleted storages past the grace window, data and
    /// history included
    pub async fn purge_deleted_storages(&self) -> Result<usize> {
        let grace_ms = i64::try_from(self.job_config.cleanup_grace().as_millis()).unwrap_or(0);
        let cutoff = epoch_millis() - grace_ms;
        let req = self
            .scroll_registry(query::bool_filter(vec![
                query::term("deleted", true),
                query::range_lte("last_updated", cutoff),
            ]))
            .with_fields(Vec::new());

        let ids: Vec<String> = scan_all(self.store.as_ref(), &req)
            .await?
            .into_iter()
            .map(|doc| doc.id)
            .collect();

        let mut purged = Vec::new();
        for id in ids {
            if let Err(e) = self.purge_one(&id).await {
                warn!(storage = %id, error = %e, "purge failed, will retry next pass");
                continue;
            }
            purged.push(id);
        }
        self.cache.invalidate(&purged);
        Ok(purged.len())
    }

    /// Soft-delete storages of machines that no longer exist
    pub async fn cleanup_vm_storages(&self) -> Result<usize> {
        let now = epoch_millis();
        let req = self.scroll_registry(query::bool_filter(vec![
            query::term("kind", KIND_VM),
            query::term("deleted", false),
        ]));

        let mut orphaned = Vec::new();
        for doc in scan_all(self.store.as_ref(), &req).await? {
            let Some(vm_id) = doc.source.get("vm").and_then(Value::as_str) else {
                warn!(storage = %doc.id, "vm storage without vm field, skipping");
                continue;
            };
            if !self.resolver.vm_exists(vm_id).await? {
                orphaned.push(doc);
            }
        }
        Ok(self.soft_delete_docs(orphaned, now).await)
    }

    /// Soft-delete storages of accounts removed within the configured
    /// lookback window
    pub async fn cleanup_removed_account_storages(&self) -> Result<usize> {
        let now = epoch_millis();
        let window_ms =
            i64::try_from(self.job_config.account_removed_window().as_millis()).unwrap_or(0);
        let removed = self.resolver.accounts_removed_since(now - window_ms).await?;

        let mut swept = 0;
        for account in removed {
            let req = self.scroll_registry(query::bool_filter(vec![
                query::term("kind", KIND_ACCOUNT),
                query::term("account", account.as_str()),
                query::term("deleted", false),
            ]));
            let docs = scan_all(self.store.as_ref(), &req).await?;
            swept += self.soft_delete_docs(docs, now).await;
        }
        Ok(swept)
    }

    // ---- Internals ----

    async fn require(&self, caller: &Caller, id: &str) -> Result<StorageRecord> {
        self.cache
            .get(caller, id)
            .await?
            .ok_or_else(|| Error::StorageNotFound(id.to_string()))
    }

    async fn write_back(&self, record: &mut StorageRecord) -> Result<()> {
        record.last_updated_ms = epoch_millis();
        self.store
            .put(
                &self.store_config.registry_index,
                &record.id,
                &record.to_value()?,
            )
            .await?;
        self.cache.invalidate(std::slice::from_ref(&record.id));
        Ok(())
    }

    fn scroll_registry(&self, query: Value) -> SearchRequest {
        SearchRequest::scroll(
            self.store_config.registry_index.clone(),
            query,
            self.store_config.scroll_keep_alive_ms,
            self.store_config.scroll_page_size,
        )
    }

    /// Mark the given documents deleted, returning how many stuck; per-doc
    /// failures are retried by the next pass
    async fn soft_delete_docs(&self, docs: Vec<Doc>, now_ms: i64) -> usize {
        let mut deleted = Vec::new();
        for mut doc in docs {
            doc.source["deleted"] = json!(true);
            doc.source["last_updated"] = json!(now_ms);
            match self
                .store
                .put(&self.store_config.registry_index, &doc.id, &doc.source)
                .await
            {
                Ok(()) => deleted.push(doc.id),
                Err(e) => {
                    warn!(storage = %doc.id, error = %e, "soft delete failed, will retry next pass");
                }
            }
        }
        self.cache.invalidate(&deleted);
        deleted.len()
    }

    async fn purge_one(&self, id: &str) -> Result<()> {
        self.store
            .delete_index(&self.store_config.data_index(id))
            .await?;
        self.store
            .delete_index(&self.store_config.history_index(id))
            .await?;
        self.store
            .delete(&self.store_config.registry_index, id)
            .await
    }

    fn history_page(page: kvgrid_store::SearchPage) -> Result<PagedResult<HistoryEntry>> {
        let items = page
            .docs
            .iter()
            .map(HistoryEntry::from_store_doc)
            .collect::<Result<Vec<_>>>()?;
        Ok(PagedResult {
            items,
            total: page.total,
            cursor: page.cursor,
        })
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("storage name must not be empty"));
        }
        if name.len() > self.limits.max_name_len {
            return Err(Error::invalid_argument(format!(
                "storage name exceeds {} characters",
                self.limits.max_name_len
            )));
        }
        Ok(())
    }

    fn validate_description(&self, description: Option<&str>) -> Result<()> {
        if let Some(description) = description
            && description.len() > self.limits.max_description_len
        {
            return Err(Error::invalid_argument(format!(
                "storage description exceeds {} characters",
                self.limits.max_description_len
            )));
        }
        Ok(())
    }
}
