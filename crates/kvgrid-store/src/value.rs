//! Value backend client
//!
//! The per-key value traffic lives in a separate backend service; this
//! client covers the one call the control plane makes to it. Timeouts keep
//! a stalled backend from starving the callers.

use kvgrid_common::{Error, Result, ValueBackendConfig, ValueErrorCode};
use std::time::Duration;
use tracing::warn;

/// HTTP client for the value backend
pub struct ValueClient {
    http: reqwest::Client,
    base_url: String,
}

impl ValueClient {
    /// Build a client from the backend configuration
    pub fn new(config: &ValueBackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::configuration(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch one value by storage id and key
    ///
    /// 200 returns the raw value; 404 maps to the typed key-not-found code;
    /// anything else, including transport failures, is a generic backend
    /// failure the caller may retry.
    pub async fn get(&self, storage_id: &str, key: &str) -> Result<String> {
        let url = format!("{}/get/{storage_id}/{key}", self.base_url);

        let resp = self.http.get(&url).send().await.map_err(|e| {
            warn!(storage = storage_id, error = %e, "value backend request failed");
            Error::ValueBackend(ValueErrorCode::OperationFailed)
        })?;

        match resp.status() {
            reqwest::StatusCode::OK => resp
                .text()
                .await
                .map_err(|e| Error::serialization(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::ValueBackend(ValueErrorCode::KeyNotFound))
            }
            status => {
                warn!(storage = storage_id, %status, "value backend returned unexpected status");
                Err(Error::ValueBackend(ValueErrorCode::OperationFailed))
            }
        }
    }

    /// Liveness probe against the backend root
    pub async fn health_check(&self) -> bool {
        self.http
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| !r.status().is_server_error())
            .unwrap_or(false)
    }
}
