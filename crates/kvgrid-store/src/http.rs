//! HTTP implementation of [`DocStore`]
//!
//! Talks to an Elasticsearch-compatible REST API. Requests carry connect
//! and request timeouts so a stalled store cannot wedge the schedulers;
//! requests rotate across the configured endpoint list. Expected statuses
//! (404 on lookups and deletes, 409 on duplicate creates) map to typed
//! results, everything else to a generic operation failure. This layer
//! never retries.

use crate::api::{
    ConditionalUpdate, Doc, DocStore, PageMode, SearchPage, SearchRequest, UpdateOutcome,
};
use async_trait::async_trait;
use kvgrid_common::{Error, Result, ScrollCursor, StoreConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Lease-acquire script: take the lock when it is free or the holder's
/// lease has gone stale, otherwise leave the document untouched.
const ACQUIRE_SCRIPT: &str = "if (ctx._source.locked == false || \
     params.now - ctx._source.timestamp > params.stale_after) { \
     ctx._source.locked = true; ctx._source.timestamp = params.now; } \
     else { ctx.op = 'none'; }";

/// Lease-release script: unconditional.
const RELEASE_SCRIPT: &str =
    "ctx._source.locked = false; ctx._source.timestamp = params.now;";

/// Document store client over HTTP
pub struct HttpDocStore {
    http: reqwest::Client,
    endpoints: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    next_endpoint: AtomicUsize,
}

impl HttpDocStore {
    /// Build a client from the store configuration
    pub fn new(config: &StoreConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::configuration("store endpoint list is empty"));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            next_endpoint: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> &str {
        let i = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[i % self.endpoints.len()]
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.endpoint().trim_end_matches('/'), path);
        let builder = self.http.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        op: &'static str,
    ) -> Result<reqwest::Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::StoreTimeout
            } else {
                warn!(op, error = %e, "document store request failed");
                Error::StoreUnavailable(e.to_string())
            }
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
        op: &'static str,
    ) -> Result<T> {
        resp.json::<T>()
            .await
            .map_err(|e| Error::serialization(format!("{op}: {e}")))
    }

    fn fail(resp: &reqwest::Response, op: &'static str) -> Error {
        warn!(op, status = %resp.status(), "document store returned unexpected status");
        Error::RequestFailed { op }
    }
}

/// Render the body for a conditional update request
fn update_body(update: ConditionalUpdate) -> Value {
    match update {
        ConditionalUpdate::AcquireLease { now_ms, stale_after_ms } => json!({
            "scripted_upsert": true,
            "upsert": { "locked": false, "timestamp": 0 },
            "script": {
                "lang": "painless",
                "source": ACQUIRE_SCRIPT,
                "params": { "now": now_ms, "stale_after": stale_after_ms }
            }
        }),
        ConditionalUpdate::ReleaseLease { now_ms } => json!({
            "scripted_upsert": true,
            "upsert": { "locked": false, "timestamp": now_ms },
            "script": {
                "lang": "painless",
                "source": RELEASE_SCRIPT,
                "params": { "now": now_ms }
            }
        }),
    }
}

/// Render the body for a search request
fn search_body(req: &SearchRequest) -> Value {
    let mut body = json!({
        "query": req.query,
        "sort": [{ "_id": "asc" }],
    });
    if let Some(fields) = &req.fields {
        body["_source"] = json!(fields);
    }
    match req.page {
        PageMode::Offset { from, size } => {
            body["from"] = json!(from);
            body["size"] = json!(size);
        }
        PageMode::Scroll { size, .. } => {
            body["size"] = json!(size);
        }
    }
    body
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(rename = "_id")]
    id: String,
    found: bool,
    #[serde(rename = "_source", default)]
    source: Value,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Deserialize)]
struct UpdateResponse {
    result: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<HitsTotal>,
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct HitsTotal {
    value: u64,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Value,
}

impl SearchResponse {
    fn into_page(self, keep_alive_ms: Option<u64>) -> SearchPage {
        let docs = self
            .hits
            .hits
            .into_iter()
            .map(|h| Doc { id: h.id, source: h.source })
            .collect();
        let cursor = match (self.scroll_id, keep_alive_ms) {
            (Some(token), Some(keep_alive_ms)) => Some(ScrollCursor::new(token, keep_alive_ms)),
            _ => None,
        };
        SearchPage {
            docs,
            total: self.hits.total.map_or(0, |t| t.value),
            cursor,
        }
    }
}

#[async_trait]
impl DocStore for HttpDocStore {
    async fn get(&self, index: &str, id: &str) -> Result<Option<Doc>> {
        let resp = self
            .send(self.request(reqwest::Method::GET, &format!("{index}/_doc/{id}")), "get")
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "get"));
        }

        let body: GetResponse = Self::parse(resp, "get").await?;
        if !body.found {
            return Ok(None);
        }
        Ok(Some(Doc { id: body.id, source: body.source }))
    }

    async fn create(&self, index: &str, id: Option<&str>, body: &Value) -> Result<String> {
        let resp = match id {
            Some(id) => {
                let resp = self
                    .send(
                        self.request(reqwest::Method::PUT, &format!("{index}/_create/{id}"))
                            .json(body),
                        "create",
                    )
                    .await?;
                if resp.status() == reqwest::StatusCode::CONFLICT {
                    return Err(Error::StorageAlreadyExists(id.to_string()));
                }
                resp
            }
            None => {
                self.send(
                    self.request(reqwest::Method::POST, &format!("{index}/_doc")).json(body),
                    "create",
                )
                .await?
            }
        };

        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "create"));
        }
        let created: CreateResponse = Self::parse(resp, "create").await?;
        Ok(created.id)
    }

    async fn put(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        let resp = self
            .send(
                self.request(reqwest::Method::PUT, &format!("{index}/_doc/{id}")).json(body),
                "replace",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "replace"));
        }
        Ok(())
    }

    async fn conditional_update(
        &self,
        index: &str,
        id: &str,
        update: ConditionalUpdate,
    ) -> Result<UpdateOutcome> {
        let resp = self
            .send(
                self.request(reqwest::Method::POST, &format!("{index}/_update/{id}"))
                    .json(&update_body(update)),
                "conditional-update",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "conditional-update"));
        }

        let body: UpdateResponse = Self::parse(resp, "conditional-update").await?;
        if body.result == "noop" {
            Ok(UpdateOutcome::Noop)
        } else {
            Ok(UpdateOutcome::Applied)
        }
    }

    async fn delete(&self, index: &str, id: &str) -> Result<()> {
        let resp = self
            .send(self.request(reqwest::Method::DELETE, &format!("{index}/_doc/{id}")), "delete")
            .await?;
        // Absent documents delete cleanly; purge jobs retry and must stay
        // idempotent.
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(Self::fail(&resp, "delete"))
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let resp = self
            .send(self.request(reqwest::Method::DELETE, index), "delete-index")
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(Self::fail(&resp, "delete-index"))
    }

    async fn search(&self, req: &SearchRequest) -> Result<SearchPage> {
        let keep_alive = match req.page {
            PageMode::Offset { .. } => None,
            PageMode::Scroll { keep_alive_ms, .. } => Some(keep_alive_ms),
        };
        let path = match keep_alive {
            Some(ms) => format!("{}/_search?scroll={ms}ms", req.index),
            None => format!("{}/_search", req.index),
        };

        let resp = self
            .send(
                self.request(reqwest::Method::POST, &path).json(&search_body(req)),
                "search",
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "search"));
        }

        let body: SearchResponse = Self::parse(resp, "search").await?;
        Ok(body.into_page(keep_alive))
    }

    async fn scroll(&self, cursor: &ScrollCursor) -> Result<SearchPage> {
        let resp = self
            .send(
                self.request(reqwest::Method::POST, "_search/scroll").json(&json!({
                    "scroll": format!("{}ms", cursor.keep_alive_ms),
                    "scroll_id": cursor.token,
                })),
                "scroll",
            )
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::CursorExpired);
        }
        if !resp.status().is_success() {
            return Err(Self::fail(&resp, "scroll"));
        }

        let body: SearchResponse = Self::parse(resp, "scroll").await?;
        Ok(body.into_page(Some(cursor.keep_alive_ms)))
    }

    async fn clear_scroll(&self, cursor: &ScrollCursor) -> Result<()> {
        let resp = self
            .send(
                self.request(reqwest::Method::DELETE, "_search/scroll")
                    .json(&json!({ "scroll_id": [cursor.token] })),
                "clear-scroll",
            )
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND || resp.status().is_success() {
            return Ok(());
        }
        Err(Self::fail(&resp, "clear-scroll"))
    }
}
