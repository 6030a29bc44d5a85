//! Document store contract
//!
//! `DocStore` is the seam between the control plane and the external
//! document store. It is object-safe so components can share one
//! `Arc<dyn DocStore>`; sources travel as raw JSON and are decoded by the
//! registry layer, which owns structural validation.

use async_trait::async_trait;
use kvgrid_common::{Result, ScrollCursor};
use serde_json::Value;

/// One stored document together with its store-assigned identifier
///
/// Search hits always carry the identifier; a source without its id is
/// useless to the cache and the cleanup scans.
#[derive(Clone, Debug)]
pub struct Doc {
    /// Store-assigned identifier
    pub id: String,
    /// Raw document body
    pub source: Value,
}

/// A single atomic conditional update
///
/// The store applies the whole update or none of it; a read-then-write
/// pair is not an acceptable implementation. Backends with compare-and-swap,
/// transactions or server-side scripting all satisfy this.
#[derive(Clone, Copy, Debug)]
pub enum ConditionalUpdate {
    /// Take the lease if it is free, or if the current holder's lease is
    /// older than `stale_after_ms` (presumed crashed). On success sets
    /// `locked = true, timestamp = now_ms`. Creates the document when
    /// absent.
    AcquireLease { now_ms: i64, stale_after_ms: i64 },
    /// Unconditionally set `locked = false, timestamp = now_ms`.
    ReleaseLease { now_ms: i64 },
}

/// Whether a conditional update changed the document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The condition held and the update was applied
    Applied,
    /// The condition failed; the document is unchanged
    Noop,
}

/// Pagination mode for a search
#[derive(Clone, Debug)]
pub enum PageMode {
    /// Offset/size window, for small bounded listings
    Offset { from: usize, size: usize },
    /// Cursor traversal for unbounded result sets; the cursor times out
    /// server-side unless renewed by a follow-up page request
    Scroll { keep_alive_ms: u64, size: usize },
}

/// A search against one index
#[derive(Clone, Debug)]
pub struct SearchRequest {
    /// Index to search
    pub index: String,
    /// Store query body (see [`crate::query`])
    pub query: Value,
    /// Field projection; `None` returns full sources
    pub fields: Option<Vec<String>>,
    /// Pagination mode
    pub page: PageMode,
}

impl SearchRequest {
    /// Offset-paginated search, sorted by id ascending
    pub fn offset(index: impl Into<String>, query: Value, from: usize, size: usize) -> Self {
        Self {
            index: index.into(),
            query,
            fields: None,
            page: PageMode::Offset { from, size },
        }
    }

    /// Cursor-paginated search, sorted by id ascending
    pub fn scroll(
        index: impl Into<String>,
        query: Value,
        keep_alive_ms: u64,
        size: usize,
    ) -> Self {
        Self {
            index: index.into(),
            query,
            fields: None,
            page: PageMode::Scroll { keep_alive_ms, size },
        }
    }

    /// Restrict returned sources to the given fields
    #[must_use]
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// One page of search results
#[derive(Clone, Debug)]
pub struct SearchPage {
    /// Hits on this page, each carrying its store id
    pub docs: Vec<Doc>,
    /// Total matching documents reported by the store
    pub total: u64,
    /// Continuation cursor; implementations may still return one on the
    /// final page, so traversals stop on the first empty page
    pub cursor: Option<ScrollCursor>,
}

/// Request/execution layer over the external document store
///
/// Errors: expected outcomes (absent document on `get`, duplicate on
/// `create`) map to typed results; every other non-2xx response becomes
/// `Error::RequestFailed` naming the operation. No retries happen here —
/// callers that want retry semantics get them from their own cadence.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Point lookup by id; `None` when the document does not exist
    async fn get(&self, index: &str, id: &str) -> Result<Option<Doc>>;

    /// Create a document, rejecting duplicates
    ///
    /// With an explicit id an existing document yields
    /// `Error::StorageAlreadyExists`; with `None` the store assigns an id.
    /// Returns the id of the created document.
    async fn create(&self, index: &str, id: Option<&str>, body: &Value) -> Result<String>;

    /// Full-document replace (creates when absent)
    async fn put(&self, index: &str, id: &str, body: &Value) -> Result<()>;

    /// Apply one atomic conditional update
    async fn conditional_update(
        &self,
        index: &str,
        id: &str,
        update: ConditionalUpdate,
    ) -> Result<UpdateOutcome>;

    /// Delete a document by id; deleting an absent document succeeds
    async fn delete(&self, index: &str, id: &str) -> Result<()>;

    /// Drop an entire index; dropping an absent index succeeds
    async fn delete_index(&self, index: &str) -> Result<()>;

    /// Run a search; scroll-mode requests open a cursor
    async fn search(&self, req: &SearchRequest) -> Result<SearchPage>;

    /// Fetch the next page of a cursor traversal, renewing its keep-alive
    async fn scroll(&self, cursor: &ScrollCursor) -> Result<SearchPage>;

    /// Release a cursor before its timeout
    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<()>;
}

/// Drain a scroll traversal into a vector of documents
///
/// Visits every page of the cursor and releases it afterwards. Intended for
/// maintenance scans whose result sets are large but bounded by the
/// registry size; per-key value data never flows through this.
pub async fn scan_all(store: &dyn DocStore, req: &SearchRequest) -> Result<Vec<Doc>> {
    let page = store.search(req).await?;
    let mut docs = page.docs;
    let mut cursor = page.cursor;

    while let Some(current) = cursor {
        let next = store.scroll(&current).await?;
        if next.docs.is_empty() {
            let _ = store.clear_scroll(&current).await;
            break;
        }
        docs.extend(next.docs);
        cursor = next.cursor;
    }

    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_search_request_builders() {
        let req = SearchRequest::offset("idx", json!({"match_all": {}}), 10, 20);
        assert!(matches!(req.page, PageMode::Offset { from: 10, size: 20 }));
        assert!(req.fields.is_none());

        let req = SearchRequest::scroll("idx", json!({"match_all": {}}), 60_000, 500)
            .with_fields(vec!["last_updated".to_string()]);
        assert!(matches!(req.page, PageMode::Scroll { keep_alive_ms: 60_000, size: 500 }));
        assert_eq!(req.fields.as_deref(), Some(&["last_updated".to_string()][..]));
    }
}
