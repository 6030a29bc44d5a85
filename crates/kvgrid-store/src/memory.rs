//! In-process implementation of [`DocStore`]
//!
//! Backs development setups and every concurrency property test; in
//! production the store is the remote document cluster behind
//! [`crate::HttpDocStore`]. All state lives behind one mutex, which makes
//! conditional updates atomic by construction. Per-operation call counters
//! and fault injection exist for collaborator assertions in tests.

use crate::api::{
    ConditionalUpdate, Doc, DocStore, PageMode, SearchPage, SearchRequest, UpdateOutcome,
};
use async_trait::async_trait;
use kvgrid_common::{Error, Result, ScrollCursor};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

struct ScrollState {
    remaining: VecDeque<Doc>,
    page_size: usize,
    total: u64,
    keep_alive: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    indexes: HashMap<String, BTreeMap<String, Value>>,
    scrolls: HashMap<String, ScrollState>,
}

/// Per-operation call counters
#[derive(Default)]
struct OpCounters {
    gets: AtomicU64,
    creates: AtomicU64,
    replaces: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    searches: AtomicU64,
    scrolls: AtomicU64,
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryDocStore {
    inner: Mutex<Inner>,
    counters: OpCounters,
    failing: Mutex<HashSet<&'static str>>,
    get_delay: Mutex<Option<Duration>>,
}

impl MemoryDocStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls issued so far
    pub fn get_calls(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }

    /// Number of `search` calls issued so far
    pub fn search_calls(&self) -> u64 {
        self.counters.searches.load(Ordering::Relaxed)
    }

    /// Number of `scroll` page fetches issued so far
    pub fn scroll_calls(&self) -> u64 {
        self.counters.scrolls.load(Ordering::Relaxed)
    }

    /// Make the named operation fail with a transient error until cleared
    pub fn set_failing(&self, op: &'static str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(op);
        } else {
            set.remove(op);
        }
    }

    /// Direct read of a stored document, bypassing counters
    pub fn raw(&self, index: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .indexes
            .get(index)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// True when the index exists (documents or not)
    pub fn has_index(&self, index: &str) -> bool {
        self.inner.lock().indexes.contains_key(index)
    }

    /// Delay every `get` by the given duration; lets tests hold loads
    /// in flight long enough to overlap
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        *self.get_delay.lock() = delay;
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.lock().contains(op) {
            return Err(Error::StoreUnavailable(format!("injected failure: {op}")));
        }
        Ok(())
    }
}

/// Evaluate the query DSL subset produced by [`crate::query`]
fn matches(query: &Value, doc: &Value) -> bool {
    if query.get("match_all").is_some() {
        return true;
    }
    if let Some(term) = query.get("term").and_then(Value::as_object) {
        return term.iter().all(|(field, expected)| doc.get(field) == Some(expected));
    }
    if let Some(range) = query.get("range").and_then(Value::as_object) {
        return range.iter().all(|(field, bounds)| {
            let Some(actual) = doc.get(field).and_then(Value::as_i64) else {
                return false;
            };
            let lte_ok = bounds
                .get("lte")
                .and_then(Value::as_i64)
                .is_none_or(|b| actual <= b);
            let gte_ok = bounds
                .get("gte")
                .and_then(Value::as_i64)
                .is_none_or(|b| actual >= b);
            lte_ok && gte_ok
        });
    }
    if let Some(filters) = query
        .pointer("/bool/filter")
        .and_then(Value::as_array)
    {
        return filters.iter().all(|clause| matches(clause, doc));
    }
    false
}

fn project(source: &Value, fields: Option<&[String]>) -> Value {
    match fields {
        None => source.clone(),
        Some(fields) => {
            let mut out = Map::new();
            if let Some(obj) = source.as_object() {
                for field in fields {
                    if let Some(v) = obj.get(field) {
                        out.insert(field.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
    }
}

impl Inner {
    fn take_page(&mut self, token: &str, now: Instant) -> Result<SearchPage> {
        let expired = self.scrolls.get(token).ok_or(Error::CursorExpired)?.expires_at < now;
        if expired {
            self.scrolls.remove(token);
            return Err(Error::CursorExpired);
        }

        let state = self.scrolls.get_mut(token).ok_or(Error::CursorExpired)?;
        let take = state.page_size.min(state.remaining.len());
        let docs: Vec<Doc> = state.remaining.drain(..take).collect();
        let total = state.total;
        state.expires_at = now + state.keep_alive;
        let keep_alive_ms = u64::try_from(state.keep_alive.as_millis()).unwrap_or(u64::MAX);
        let finished = state.remaining.is_empty();

        let cursor = if finished {
            self.scrolls.remove(token);
            None
        } else {
            Some(ScrollCursor::new(token, keep_alive_ms))
        };

        Ok(SearchPage { docs, total, cursor })
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn get(&self, index: &str, id: &str) -> Result<Option<Doc>> {
        self.check("get")?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let delay = *self.get_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .inner
            .lock()
            .indexes
            .get(index)
            .and_then(|docs| docs.get(id))
            .map(|source| Doc { id: id.to_string(), source: source.clone() }))
    }

    async fn create(&self, index: &str, id: Option<&str>, body: &Value) -> Result<String> {
        self.check("create")?;
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let docs = inner.indexes.entry(index.to_string()).or_default();

        let id = match id {
            Some(id) => {
                if docs.contains_key(id) {
                    return Err(Error::StorageAlreadyExists(id.to_string()));
                }
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };
        docs.insert(id.clone(), body.clone());
        Ok(id)
    }

    async fn put(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        self.check("replace")?;
        self.counters.replaces.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .indexes
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), body.clone());
        Ok(())
    }

    async fn conditional_update(
        &self,
        index: &str,
        id: &str,
        update: ConditionalUpdate,
    ) -> Result<UpdateOutcome> {
        self.check("conditional-update")?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);

        // The whole check-and-set happens under the store mutex, mirroring
        // the atomicity the remote store's scripted update provides.
        let mut inner = self.inner.lock();
        let doc = inner
            .indexes
            .entry(index.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| json!({ "locked": false, "timestamp": 0 }));

        match update {
            ConditionalUpdate::AcquireLease { now_ms, stale_after_ms } => {
                let locked = doc["locked"].as_bool().unwrap_or(false);
                let taken_at = doc["timestamp"].as_i64().unwrap_or(0);
                if !locked || now_ms - taken_at > stale_after_ms {
                    doc["locked"] = json!(true);
                    doc["timestamp"] = json!(now_ms);
                    Ok(UpdateOutcome::Applied)
                } else {
                    Ok(UpdateOutcome::Noop)
                }
            }
            ConditionalUpdate::ReleaseLease { now_ms } => {
                doc["locked"] = json!(false);
                doc["timestamp"] = json!(now_ms);
                Ok(UpdateOutcome::Applied)
            }
        }
    }

    async fn delete(&self, index: &str, id: &str) -> Result<()> {
        self.check("delete")?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        if let Some(docs) = self.inner.lock().indexes.get_mut(index) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.check("delete-index")?;
        self.inner.lock().indexes.remove(index);
        Ok(())
    }

    async fn search(&self, req: &SearchRequest) -> Result<SearchPage> {
        self.check("search")?;
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        // BTreeMap iteration gives the id-ascending order the contract
        // promises for stable pagination.
        let matched: Vec<Doc> = inner
            .indexes
            .get(&req.index)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, source)| matches(&req.query, source))
                    .map(|(id, source)| Doc {
                        id: id.clone(),
                        source: project(source, req.fields.as_deref()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let total = matched.len() as u64;

        match req.page {
            PageMode::Offset { from, size } => {
                let docs = matched.into_iter().skip(from).take(size).collect();
                Ok(SearchPage { docs, total, cursor: None })
            }
            PageMode::Scroll { keep_alive_ms, size } => {
                let token = Uuid::new_v4().to_string();
                let keep_alive = Duration::from_millis(keep_alive_ms);
                inner.scrolls.insert(
                    token.clone(),
                    ScrollState {
                        remaining: matched.into_iter().collect(),
                        page_size: size.max(1),
                        total,
                        keep_alive,
                        expires_at: Instant::now() + keep_alive,
                    },
                );
                inner.take_page(&token, Instant::now())
            }
        }
    }

    async fn scroll(&self, cursor: &ScrollCursor) -> Result<SearchPage> {
        self.check("scroll")?;
        self.counters.scrolls.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().take_page(&cursor.token, Instant::now())
    }

    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<()> {
        self.inner.lock().scrolls.remove(&cursor.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scan_all;
    use crate::query;

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let store = MemoryDocStore::new();
        let id = store.create("idx", None, &json!({"a": 1})).await.unwrap();

        let doc = store.get("idx", &id).await.unwrap().unwrap();
        assert_eq!(doc.source, json!({"a": 1}));

        store.put("idx", &id, &json!({"a": 2})).await.unwrap();
        let doc = store.get("idx", &id).await.unwrap().unwrap();
        assert_eq!(doc.source, json!({"a": 2}));

        store.delete("idx", &id).await.unwrap();
        assert!(store.get("idx", &id).await.unwrap().is_none());
        // idempotent
        store.delete("idx", &id).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_with_explicit_id_rejects_duplicates() {
        let store = MemoryDocStore::new();
        store.create("idx", Some("x"), &json!({})).await.unwrap();
        let err = store.create("idx", Some("x"), &json!({})).await.unwrap_err();
        assert!(matches!(err, Error::StorageAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_acquire_lease_semantics() {
        let store = MemoryDocStore::new();

        // Absent document: first acquire wins, second is a no-op.
        let first = store
            .conditional_update("locks", "job", ConditionalUpdate::AcquireLease {
                now_ms: 1_000,
                stale_after_ms: 500,
            })
            .await
            .unwrap();
        assert_eq!(first, UpdateOutcome::Applied);

        let second = store
            .conditional_update("locks", "job", ConditionalUpdate::AcquireLease {
                now_ms: 1_100,
                stale_after_ms: 500,
            })
            .await
            .unwrap();
        assert_eq!(second, UpdateOutcome::Noop);

        // Stale lease is taken over without a release.
        let stale = store
            .conditional_update("locks", "job", ConditionalUpdate::AcquireLease {
                now_ms: 1_600,
                stale_after_ms: 500,
            })
            .await
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Applied);
    }

    #[tokio::test]
    async fn test_release_then_acquire() {
        let store = MemoryDocStore::new();
        let update = ConditionalUpdate::AcquireLease { now_ms: 10, stale_after_ms: 1_000 };
        store.conditional_update("locks", "job", update).await.unwrap();

        store
            .conditional_update("locks", "job", ConditionalUpdate::ReleaseLease { now_ms: 20 })
            .await
            .unwrap();

        let again = store
            .conditional_update("locks", "job", ConditionalUpdate::AcquireLease {
                now_ms: 20,
                stale_after_ms: 1_000,
            })
            .await
            .unwrap();
        assert_eq!(again, UpdateOutcome::Applied);
    }

    #[tokio::test]
    async fn test_search_filters_and_offset() {
        let store = MemoryDocStore::new();
        for i in 0..5 {
            let body = json!({"kind": if i % 2 == 0 { "A" } else { "B" }, "n": i});
            store.create("idx", Some(&format!("doc-{i}")), &body).await.unwrap();
        }

        let req = SearchRequest::offset("idx", query::term("kind", "A"), 0, 10);
        let page = store.search(&req).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.docs.len(), 3);

        let req = SearchRequest::offset("idx", query::term("kind", "A"), 1, 1);
        let page = store.search(&req).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.docs.len(), 1);
        assert_eq!(page.docs[0].id, "doc-2");
    }

    #[tokio::test]
    async fn test_field_projection() {
        let store = MemoryDocStore::new();
        store
            .create("idx", Some("d"), &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        let req = SearchRequest::offset("idx", query::match_all(), 0, 10)
            .with_fields(vec!["a".to_string()]);
        let page = store.search(&req).await.unwrap();
        assert_eq!(page.docs[0].source, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_scroll_visits_every_id_exactly_once() {
        let store = MemoryDocStore::new();
        for i in 0..2_500 {
            store
                .create("idx", Some(&format!("doc-{i:05}")), &json!({"n": i}))
                .await
                .unwrap();
        }

        let req = SearchRequest::scroll("idx", query::match_all(), 60_000, 1_000);
        let mut pages = Vec::new();
        let mut page = store.search(&req).await.unwrap();
        pages.push(page.docs.len());
        let mut seen: HashSet<String> =
            page.docs.iter().map(|d| d.id.clone()).collect();

        while let Some(cursor) = page.cursor {
            page = store.scroll(&cursor).await.unwrap();
            pages.push(page.docs.len());
            for doc in &page.docs {
                assert!(seen.insert(doc.id.clone()), "duplicate id {}", doc.id);
            }
        }

        assert_eq!(pages, vec![1_000, 1_000, 500]);
        assert_eq!(seen.len(), 2_500);
    }

    #[tokio::test]
    async fn test_scan_all_collects_everything() {
        let store = MemoryDocStore::new();
        for i in 0..2_500 {
            store
                .create("idx", Some(&format!("doc-{i:05}")), &json!({"n": i}))
                .await
                .unwrap();
        }
        let req = SearchRequest::scroll("idx", query::match_all(), 60_000, 1_000);
        let docs = scan_all(&store, &req).await.unwrap();
        assert_eq!(docs.len(), 2_500);
    }

    #[tokio::test]
    async fn test_cleared_cursor_is_gone() {
        let store = MemoryDocStore::new();
        for i in 0..10 {
            store.create("idx", Some(&format!("d{i}")), &json!({})).await.unwrap();
        }
        let req = SearchRequest::scroll("idx", query::match_all(), 60_000, 3);
        let page = store.search(&req).await.unwrap();
        let cursor = page.cursor.unwrap();
        store.clear_scroll(&cursor).await.unwrap();
        assert!(matches!(store.scroll(&cursor).await, Err(Error::CursorExpired)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryDocStore::new();
        store.set_failing("get", true);
        assert!(store.get("idx", "x").await.unwrap_err().is_transient());
        store.set_failing("get", false);
        assert!(store.get("idx", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_call_counters() {
        let store = MemoryDocStore::new();
        store.create("idx", Some("x"), &json!({})).await.unwrap();
        store.get("idx", "x").await.unwrap();
        store.get("idx", "x").await.unwrap();
        assert_eq!(store.get_calls(), 2);
    }
}
