// AicengHub — guarded AI chat gateway and curated tool catalog
// Copyright (C) 2025–2026 AicengHub contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//
//! Thin typed client for the external enrichment/search service.
//!
//! One bounded-timeout HTTP call per operation, no retries — retry policy
//! belongs to the durable queue, not the client. Errors are classified into
//! a small taxonomy that callers log and persist verbatim.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use aicenghub_config::ToolsConfig;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolsError {
    #[error("tools-not-configured")]
    NotConfigured,
    #[error("tools-timeout")]
    Timeout,
    #[error("tools-http-{0}")]
    Http(u16),
    #[error("tools-request-failed: {0}")]
    RequestFailed(String),
    #[error("{0}")]
    Upstream(String),
    #[error("tools-enrich-empty")]
    EmptyEnrichment,
}

impl ToolsError {
    /// Stable discriminator for queue rows and logs.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            ToolsError::NotConfigured => "tools-not-configured".to_string(),
            ToolsError::Timeout => "tools-timeout".to_string(),
            ToolsError::Http(status) => format!("tools-http-{status}"),
            ToolsError::RequestFailed(_) => "tools-request-failed".to_string(),
            ToolsError::Upstream(message) => message.clone(),
            ToolsError::EmptyEnrichment => "tools-enrich-empty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ToolsClient {
    base_url: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ToolsClient {
    /// Build a client from config; the timeout arrives pre-clamped (1..20s).
    ///
    /// # Errors
    ///
    /// Returns `RequestFailed` if the underlying HTTP client cannot be built.
    pub fn from_config(config: &ToolsConfig) -> Result<Self, ToolsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ToolsError::RequestFailed(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, ToolsError> {
        let base = self.base_url.as_deref().ok_or(ToolsError::NotConfigured)?;
        Ok(format!("{base}{path}"))
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ToolsError> {
        let endpoint = self.endpoint(path)?;
        let mut builder = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(classify_request_error)?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ToolsError::Http(status));
        }
        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ToolsError::RequestFailed(e.to_string()))?;
        if let Some(message) = payload.get("error").and_then(serde_json::Value::as_str) {
            return Err(ToolsError::Upstream(message.to_string()));
        }
        Ok(payload)
    }

    /// `GET /health` — true when the service answers 2xx.
    pub async fn health(&self) -> Result<bool, ToolsError> {
        let endpoint = self.endpoint("/health")?;
        let mut builder = self.client.get(&endpoint);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(classify_request_error)?;
        Ok(resp.status().is_success())
    }

    /// `POST /enrich {url, mode}`.
    pub async fn enrich(&self, url: &str, mode: &str) -> Result<serde_json::Value, ToolsError> {
        self.post("/enrich", serde_json::json!({ "url": url, "mode": mode }))
            .await
    }

    /// `POST /search {query}`.
    pub async fn search(&self, query: &str) -> Result<serde_json::Value, ToolsError> {
        self.post("/search", serde_json::json!({ "query": query }))
            .await
    }
}

fn classify_request_error(e: reqwest::Error) -> ToolsError {
    if e.is_timeout() {
        ToolsError::Timeout
    } else {
        ToolsError::RequestFailed(e.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base: Option<&str>) -> ToolsConfig {
        ToolsConfig {
            base_url: base.map(str::to_string),
            api_key: Some("test-key".to_string()),
            timeout_ms: 6000,
        }
    }

    #[tokio::test]
    async fn test_unconfigured_client_reports_not_configured() {
        let client = ToolsClient::from_config(&config(None)).unwrap();
        assert_eq!(
            client.enrich("https://example.com", "chat").await.unwrap_err(),
            ToolsError::NotConfigured
        );
        assert_eq!(
            client.search("anything").await.unwrap_err(),
            ToolsError::NotConfigured
        );
        assert_eq!(client.health().await.unwrap_err(), ToolsError::NotConfigured);
    }

    #[test]
    fn test_endpoint_joins_base_and_path() {
        let client = ToolsClient::from_config(&config(Some("https://tools.example/api"))).unwrap();
        assert_eq!(
            client.endpoint("/enrich").unwrap(),
            "https://tools.example/api/enrich"
        );
    }

    #[test]
    fn test_error_codes_render_wire_strings() {
        assert_eq!(ToolsError::NotConfigured.code(), "tools-not-configured");
        assert_eq!(ToolsError::Timeout.code(), "tools-timeout");
        assert_eq!(ToolsError::Http(503).code(), "tools-http-503");
        assert_eq!(
            ToolsError::RequestFailed("boom".to_string()).code(),
            "tools-request-failed"
        );
        assert_eq!(ToolsError::EmptyEnrichment.code(), "tools-enrich-empty");
        assert_eq!(
            ToolsError::Upstream("quota exceeded".to_string()).code(),
            "quota exceeded"
        );
    }

    #[test]
    fn test_error_display_matches_taxonomy() {
        assert_eq!(ToolsError::Timeout.to_string(), "tools-timeout");
        assert_eq!(ToolsError::Http(429).to_string(), "tools-http-429");
    }
}
