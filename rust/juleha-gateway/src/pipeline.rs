/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The chat request pipeline: gates, sanitization, classification, live
//! tools or legacy verification, context assembly, model fan-out, output
//! guard, and candidate side effects.

use std::sync::{Arc, LazyLock};

use aicenghub_catalog::{
    canonicalize_url, extract_urls, normalize_tool_items, NormalizeLimits, ToolItem,
};
use aicenghub_guard::{is_harmful_intent, is_prompt_injection, redact_secrets};
use aicenghub_store::{
    CandidateUpsert, MainLinkEnrichment, QueueJobInsert, ToolCheckRecord,
};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{
    self, external_tagged_urls, select_capture_targets, verify_url, CaptureAudit, VerifiedLink,
    FETCH_CONCURRENCY,
};
use crate::prompts::{
    ensure_tools_down_banner, output_is_prompt_leak, HARM_REFUSAL, INJECTION_REFUSAL,
    POLICY_ROUTE_LABEL, PROMPT_LEAK_REFUSAL, SERVER_SYSTEM_PROMPT,
};
use crate::sanitize::{latest_user_text, sanitize_conversation, ChatRequest};
use crate::{upstream, AppState};

/// Request bodies above this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Most user URLs considered per request.
const MAX_USER_URLS: usize = 6;

const CHAT_LIMIT: u64 = 30;
const URL_LIMIT: u64 = 10;
const LIMIT_WINDOW_MS: i64 = 10 * 60 * 1000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("origin-blocked")]
    OriginBlocked,
    #[error("body-too-large")]
    BodyTooLarge,
    #[error("rate-limited-chat")]
    RateLimitedChat { retry_after_secs: u64 },
    #[error("rate-limited-url")]
    RateLimitedUrl { retry_after_secs: u64 },
    #[error("invalid-payload")]
    InvalidPayload,
    #[error("no-user-message")]
    NoUserMessage,
    #[error("no-routes-configured")]
    NoRoutesConfigured,
    #[error("all-routes-failed")]
    AllRoutesFailed,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            PipelineError::OriginBlocked => {
                (StatusCode::FORBIDDEN, "origin not allowed", None)
            }
            PipelineError::BodyTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large", None)
            }
            PipelineError::RateLimitedChat { retry_after_secs }
            | PipelineError::RateLimitedUrl { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate limit exceeded, try again later",
                Some(retry_after_secs),
            ),
            PipelineError::InvalidPayload => (StatusCode::BAD_REQUEST, "invalid payload", None),
            PipelineError::NoUserMessage => (
                StatusCode::BAD_REQUEST,
                "conversation must include a user message",
                None,
            ),
            PipelineError::NoRoutesConfigured => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "no upstream routes configured",
                None,
            ),
            PipelineError::AllRoutesFailed => (
                StatusCode::BAD_GATEWAY,
                "all upstream routes failed",
                None,
            ),
        };
        let mut resp =
            (status, Json(serde_json::json!({ "error": message }))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                resp.headers_mut().insert("Retry-After", value);
            }
        }
        resp
    }
}

// ---------------------------------------------------------------------------
// Response shape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub assistant_text: String,
    pub route_label: String,
    pub verified_links: Vec<VerifiedLink>,
}

impl ChatResponse {
    fn guardrail(text: &str) -> Self {
        Self {
            assistant_text: text.to_string(),
            route_label: POLICY_ROUTE_LABEL.to_string(),
            verified_links: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RequestAudit {
    pub request_id: String,
    pub ip: String,
    pub ip_hash: String,
    pub session_hash: String,
}

fn salted_hash(salt: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{salt}:{value}").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client IP: first `x-forwarded-for` entry, else `x-real-ip`, else 0.0.0.0.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    header_str(headers, "x-real-ip")
        .map(str::to_string)
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

fn session_fingerprint(headers: &HeaderMap) -> String {
    header_str(headers, "x-session-id")
        .or_else(|| header_str(headers, "cookie"))
        .or_else(|| header_str(headers, "user-agent"))
        .unwrap_or_default()
        .to_string()
}

pub fn request_audit(headers: &HeaderMap, salt: &str) -> RequestAudit {
    let request_id = header_str(headers, "x-request-id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ip = client_ip(headers);
    let session = session_fingerprint(headers);
    RequestAudit {
        request_id,
        ip_hash: salted_hash(salt, &ip),
        session_hash: salted_hash(salt, &session),
        ip,
    }
}

// ---------------------------------------------------------------------------
// Body-size gate
// ---------------------------------------------------------------------------

/// True when either the declared Content-Length or the buffered body
/// exceeds [`MAX_BODY_BYTES`].
fn body_too_large(declared_length: Option<usize>, body_len: usize) -> bool {
    declared_length.is_some_and(|len| len > MAX_BODY_BYTES) || body_len > MAX_BODY_BYTES
}

// ---------------------------------------------------------------------------
// Origin gate
// ---------------------------------------------------------------------------

/// A missing Origin header passes. With an allow-list configured, only
/// listed origins pass; otherwise only `https://{host}` for the request's
/// own Host header does.
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>, allow: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if !allow.is_empty() {
        return allow.iter().any(|entry| entry == origin);
    }
    match host {
        Some(host) => origin == format!("https://{host}"),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Live-check classification
// ---------------------------------------------------------------------------

#[allow(clippy::unwrap_used)]
fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap()
}

static LIVE_TERMS: LazyLock<Regex> =
    LazyLock::new(|| ci(r"\b(check|browse|latest|verify|verification)\b"));
static PRICING_TERMS: LazyLock<Regex> =
    LazyLock::new(|| ci(r"\b(price|prices|pricing|cost|costs|subscription|how much)\b"));
static FRESHNESS_TERMS: LazyLock<Regex> =
    LazyLock::new(|| ci(r"\b(check|checked|verify|latest|current|update|updated)\b"));

/// A request needs a live check when it carries a URL or asks for fresh
/// information in so many words.
pub fn needs_live_check(text: &str, has_urls: bool) -> bool {
    has_urls
        || LIVE_TERMS.is_match(text)
        || (PRICING_TERMS.is_match(text) && FRESHNESS_TERMS.is_match(text))
}

// ---------------------------------------------------------------------------
// Context assembly
// ---------------------------------------------------------------------------

async fn catalog_snippet(pool: Option<&PgPool>) -> String {
    let Some(pool) = pool else {
        return "Catalog snippet: unavailable for this request; say so when asked about saved tools."
            .to_string();
    };
    match aicenghub_store::get_main_links(pool).await {
        Ok(links) => {
            if links.is_empty() {
                return "Catalog snippet: the catalog is currently empty.".to_string();
            }
            let mut block = String::from("Catalog snippet:");
            for link in links.iter().take(10) {
                block.push_str(&format!("\n- {} ({})", link.name, link.pricing_tier));
                if !link.pricing_text.is_empty() {
                    block.push_str(&format!(" — {}", link.pricing_text));
                }
            }
            block
        }
        Err(e) => {
            warn!(error = %e, "catalog snippet query failed");
            "Catalog snippet: unavailable for this request; say so when asked about saved tools."
                .to_string()
        }
    }
}

fn live_tools_context(items: &[ToolItem]) -> String {
    let mut block = String::from("Live tool check results:");
    for item in items {
        block.push_str(&format!(
            "\n- {} ({}): {}",
            if item.name.is_empty() {
                &item.canonical_url
            } else {
                &item.name
            },
            item.pricing_tier.as_str(),
            if item.description.is_empty() {
                "no description"
            } else {
                &item.description
            },
        ));
    }
    block
}

fn build_context_message(
    catalog: &str,
    url_block: Option<&str>,
    live_block: Option<&str>,
    pending_summary: Option<&str>,
) -> String {
    let mut message = String::from(catalog);
    message.push_str("\n\n");
    message.push_str(url_block.unwrap_or("No user URL checks were performed for this request."));
    message.push_str("\n\n");
    message.push_str(live_block.unwrap_or("No live tool check was performed for this request."));
    if let Some(summary) = pending_summary {
        message.push_str("\n\nPending enrichment: ");
        message.push_str(summary);
    }
    message
}

// ---------------------------------------------------------------------------
// Live-tools application
// ---------------------------------------------------------------------------

async fn apply_live_items(
    pool: &PgPool,
    audit: &RequestAudit,
    items: &[ToolItem],
) {
    let main_urls = match aicenghub_store::get_main_url_set(pool).await {
        Ok(set) => set,
        Err(e) => {
            warn!(error = %e, "main url set query failed, skipping live apply");
            return;
        }
    };

    for item in items {
        let abilities: Vec<String> = item
            .abilities
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();
        let tags: Vec<String> = item.tags.iter().map(|t| t.as_str().to_string()).collect();

        if main_urls.contains(&item.canonical_url) {
            let updated = aicenghub_store::update_main_link_enrichment(
                pool,
                &MainLinkEnrichment {
                    canonical_url: item.canonical_url.clone(),
                    name: item.name.clone(),
                    description: item.description.clone(),
                    abilities,
                    pricing_tier: item.pricing_tier.as_str().to_string(),
                    tags,
                    pricing_text: item.pricing_text.clone(),
                    is_free: item.flags.is_free,
                    has_trial: item.flags.has_trial,
                    is_paid: item.flags.is_paid,
                    favicon_url: String::new(),
                    thumbnail_url: String::new(),
                    pending_enrichment: false,
                },
            )
            .await;
            if let Err(e) = updated {
                warn!(url = %item.canonical_url, error = %e, "live main-link update failed");
            }
        } else {
            let upserted = aicenghub_store::upsert_candidate(
                pool,
                &CandidateUpsert {
                    canonical_url: item.canonical_url.clone(),
                    name: item.name.clone(),
                    description: item.description.clone(),
                    abilities,
                    pricing_tier: item.pricing_tier.as_str().to_string(),
                    tags,
                    pricing_text: item.pricing_text.clone(),
                    is_free: item.flags.is_free,
                    has_trial: item.flags.has_trial,
                    is_paid: item.flags.is_paid,
                    final_url: item.final_url.clone(),
                    content_type: item.content_type.clone(),
                    evidence_urls: item.sources.clone(),
                    evidence: serde_json::json!({"origin": "live-tools"}),
                    pending_enrichment: false,
                    discovered_by: "juleha-gateway".to_string(),
                    submitter_ip_hash: audit.ip_hash.clone(),
                    submitter_session_hash: audit.session_hash.clone(),
                    capture_reason: "live-tools".to_string(),
                    ..CandidateUpsert::default()
                },
            )
            .await;
            if let Err(e) = upserted {
                warn!(url = %item.canonical_url, error = %e, "live candidate upsert failed");
            }
        }

        let checked = aicenghub_store::insert_tool_check(
            pool,
            &ToolCheckRecord {
                canonical_url: item.canonical_url.clone(),
                result: serde_json::json!({
                    "name": item.name,
                    "pricingTier": item.pricing_tier.as_str(),
                    "origin": "live-tools",
                }),
                confidence: item.confidence,
                sources: item.sources.clone(),
            },
        )
        .await;
        if let Err(e) = checked {
            warn!(url = %item.canonical_url, error = %e, "tool-check insert failed");
        }
    }
}

async fn persist_pending_enrichment(
    pool: &PgPool,
    audit: &RequestAudit,
    urls: &[String],
) -> usize {
    let mut captured = 0usize;
    for url in urls {
        let Some(canonical) = canonicalize_url(url) else {
            continue;
        };
        let upserted = aicenghub_store::upsert_candidate(
            pool,
            &CandidateUpsert {
                canonical_url: canonical.clone(),
                final_url: url.clone(),
                evidence: serde_json::json!({"origin": "tools-down"}),
                pending_enrichment: true,
                discovered_by: "juleha-gateway".to_string(),
                submitter_ip_hash: audit.ip_hash.clone(),
                submitter_session_hash: audit.session_hash.clone(),
                capture_reason: "pending-enrichment-tools-down".to_string(),
                ..CandidateUpsert::default()
            },
        )
        .await;
        if let Err(e) = upserted {
            warn!(url = %canonical, error = %e, "pending candidate upsert failed");
            continue;
        }
        let enqueued = aicenghub_store::enqueue_scrape_job(
            pool,
            &QueueJobInsert {
                canonical_url: canonical.clone(),
                requested_url: url.clone(),
                reason: "tools-down-pending-enrichment".to_string(),
                payload: serde_json::json!({"origin": "tools-down"}),
                next_run_at: None,
            },
        )
        .await;
        if let Err(e) = enqueued {
            warn!(url = %canonical, error = %e, "pending enqueue failed");
        }
        captured += 1;
    }
    captured
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub async fn juleha_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    // A buffering rejection here means the outer body bound tripped.
    let Ok(body) = body else {
        return PipelineError::BodyTooLarge.into_response();
    };
    match chat_inner(&state, &headers, &body).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

#[allow(clippy::too_many_lines)]
async fn chat_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<ChatResponse, PipelineError> {
    let audit = request_audit(headers, &state.config.audit_salt);

    if !origin_allowed(
        header_str(headers, "origin"),
        header_str(headers, "host"),
        &state.config.allowed_origins,
    ) {
        return Err(PipelineError::OriginBlocked);
    }

    let declared_length =
        header_str(headers, "content-length").and_then(|v| v.parse::<usize>().ok());
    if body_too_large(declared_length, body.len()) {
        return Err(PipelineError::BodyTooLarge);
    }

    let chat_key = format!("chat:{}", audit.ip);
    let decision = state
        .limiter
        .consume(&chat_key, CHAT_LIMIT, LIMIT_WINDOW_MS, 1)
        .await;
    if !decision.allowed {
        return Err(PipelineError::RateLimitedChat {
            retry_after_secs: decision.retry_after_secs,
        });
    }

    let request: ChatRequest =
        serde_json::from_slice(body).map_err(|_| PipelineError::InvalidPayload)?;
    if request.messages.is_empty() {
        return Err(PipelineError::InvalidPayload);
    }
    let conversation =
        sanitize_conversation(&request.messages).ok_or(PipelineError::NoUserMessage)?;
    let latest = latest_user_text(&conversation);

    if is_prompt_injection(&latest) {
        info!(request_id = %audit.request_id, "guardrail: prompt injection");
        return Ok(ChatResponse::guardrail(INJECTION_REFUSAL));
    }
    if is_harmful_intent(&latest) {
        info!(request_id = %audit.request_id, "guardrail: harmful intent");
        return Ok(ChatResponse::guardrail(HARM_REFUSAL));
    }

    if state.routes.routes.is_empty() {
        return Err(PipelineError::NoRoutesConfigured);
    }

    let pool = state.pool.as_ref();
    let urls = extract_urls(&latest, MAX_USER_URLS);
    let live_requested = needs_live_check(&latest, !urls.is_empty());
    let gate = Arc::new(Semaphore::new(FETCH_CONCURRENCY));

    let mut tools_down = false;
    let mut pending_count = 0usize;
    let mut live_block: Option<String> = None;

    if live_requested {
        let result = if urls.is_empty() {
            state.tools.search(&latest).await
        } else {
            state.tools.enrich(&urls[0], "chat").await
        };
        match result {
            Ok(response) => {
                let items = normalize_tool_items(&response, NormalizeLimits::default());
                if items.is_empty() {
                    debug!(request_id = %audit.request_id, "live tools returned no items");
                } else {
                    if let Some(pool) = pool {
                        apply_live_items(pool, &audit, &items).await;
                    }
                    live_block = Some(live_tools_context(&items));
                }
            }
            Err(e) => {
                warn!(request_id = %audit.request_id, error = %e.code(), "live tools unavailable");
                tools_down = true;
                if let Some(pool) = pool {
                    pending_count = persist_pending_enrichment(pool, &audit, &urls).await;
                }
            }
        }
    }

    let mut verified_links: Vec<VerifiedLink> = Vec::new();
    let mut url_block: Option<String> = None;
    if !live_requested && state.config.verify_links && !urls.is_empty() {
        let url_key = format!("url:{}", audit.ip);
        let decision = state
            .limiter
            .consume(&url_key, URL_LIMIT, LIMIT_WINDOW_MS, urls.len() as u64)
            .await;
        if !decision.allowed {
            return Err(PipelineError::RateLimitedUrl {
                retry_after_secs: decision.retry_after_secs,
            });
        }
        for url in &urls {
            verified_links.push(verify_url(&state.fetcher, &gate, url).await);
        }
        url_block = Some(capture::url_check_context(&verified_links));
    }

    let pending_summary = (pending_count > 0)
        .then(|| format!("{pending_count} URL(s) captured for later enrichment."));
    let context = build_context_message(
        &catalog_snippet(pool).await,
        url_block.as_deref(),
        live_block.as_deref(),
        pending_summary.as_deref(),
    );
    let system_messages = vec![SERVER_SYSTEM_PROMPT.to_string(), context];

    let outcome = upstream::fan_out(
        &state.upstream,
        &state.routes,
        &system_messages,
        &conversation,
    )
    .await
    .ok_or(PipelineError::AllRoutesFailed)?;

    let mut assistant_text = redact_secrets(&outcome.text);
    if output_is_prompt_leak(&assistant_text) {
        warn!(request_id = %audit.request_id, route = %outcome.label, "blocked-output");
        return Ok(ChatResponse::guardrail(PROMPT_LEAK_REFUSAL));
    }

    if !live_requested && state.config.capture_candidates {
        if let Some(pool) = pool {
            let assistant_urls = extract_urls(&assistant_text, MAX_USER_URLS);
            if !assistant_urls.is_empty() {
                let url_key = format!("url:{}", audit.ip);
                let decision = state
                    .limiter
                    .consume(&url_key, URL_LIMIT, LIMIT_WINDOW_MS, assistant_urls.len() as u64)
                    .await;
                if decision.allowed {
                    let mut assistant_verified = Vec::new();
                    for url in &assistant_urls {
                        assistant_verified.push(verify_url(&state.fetcher, &gate, url).await);
                    }
                    let tagged = external_tagged_urls(&assistant_text);
                    let main_urls = match aicenghub_store::get_main_url_set(pool).await {
                        Ok(set) => set,
                        Err(e) => {
                            warn!(error = %e, "main url set query failed, skipping capture");
                            Default::default()
                        }
                    };
                    let targets = select_capture_targets(&assistant_verified, &tagged, &main_urls);
                    let captured = capture::capture_candidates(
                        pool,
                        &state.fetcher,
                        &gate,
                        &targets,
                        &CaptureAudit {
                            discovered_by: "juleha-gateway".to_string(),
                            ip_hash: audit.ip_hash.clone(),
                            session_hash: audit.session_hash.clone(),
                        },
                    )
                    .await;
                    if captured > 0 {
                        info!(request_id = %audit.request_id, captured, "candidates captured");
                    }
                } else {
                    debug!(request_id = %audit.request_id, "url bucket drained, skipping capture");
                }
            }
        }
    }

    if tools_down {
        assistant_text = ensure_tools_down_banner(&assistant_text, pending_summary.as_deref());
    }

    info!(
        request_id = %audit.request_id,
        route = %outcome.label,
        verified = verified_links.len(),
        "chat request served"
    );

    Ok(ChatResponse {
        assistant_text,
        route_label: outcome.label,
        verified_links,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.10, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers), "203.0.113.10");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(client_ip(&headers), "198.51.100.2");

        assert_eq!(client_ip(&HeaderMap::new()), "0.0.0.0");
    }

    #[test]
    fn test_audit_hashes_are_salted_sha256() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.10"));
        let audit = request_audit(&headers, "pepper");
        assert_eq!(audit.ip_hash, salted_hash("pepper", "203.0.113.10"));
        assert_eq!(audit.ip_hash.len(), 64);
        let other = request_audit(&headers, "different-salt");
        assert_ne!(audit.ip_hash, other.ip_hash);
    }

    #[test]
    fn test_request_id_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("req-42"));
        assert_eq!(request_audit(&headers, "").request_id, "req-42");
        let generated = request_audit(&HeaderMap::new(), "").request_id;
        assert_eq!(generated.len(), 36);
    }

    #[test]
    fn test_session_fingerprint_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("curl/8"));
        assert_eq!(session_fingerprint(&headers), "curl/8");
        headers.insert("cookie", HeaderValue::from_static("sid=9"));
        assert_eq!(session_fingerprint(&headers), "sid=9");
        headers.insert("x-session-id", HeaderValue::from_static("sess-1"));
        assert_eq!(session_fingerprint(&headers), "sess-1");
    }

    #[test]
    fn test_body_size_gate() {
        assert!(!body_too_large(None, MAX_BODY_BYTES));
        assert!(body_too_large(None, MAX_BODY_BYTES + 1));
        assert!(body_too_large(Some(MAX_BODY_BYTES + 1), 0));
        assert!(!body_too_large(Some(MAX_BODY_BYTES), MAX_BODY_BYTES));
    }

    #[test]
    fn test_origin_gate() {
        let allow = vec!["https://aicenghub.com".to_string()];
        assert!(origin_allowed(None, Some("anything"), &allow));
        assert!(origin_allowed(
            Some("https://aicenghub.com"),
            None,
            &allow
        ));
        assert!(!origin_allowed(Some("https://evil.example"), None, &allow));

        // No allow-list: only the request's own https origin passes.
        assert!(origin_allowed(
            Some("https://api.example"),
            Some("api.example"),
            &[]
        ));
        assert!(!origin_allowed(
            Some("http://api.example"),
            Some("api.example"),
            &[]
        ));
        assert!(!origin_allowed(Some("https://other.example"), Some("api.example"), &[]));
    }

    #[test]
    fn test_needs_live_check_classification() {
        assert!(needs_live_check("please check this tool", false));
        assert!(needs_live_check("what's the latest version", false));
        assert!(needs_live_check("verification needed", false));
        assert!(needs_live_check("irrelevant", true), "URLs force a live check");
        assert!(needs_live_check("is the pricing still current?", false));
        assert!(
            !needs_live_check("what's the subscription cost", false),
            "pricing terms alone do not trigger"
        );
        assert!(!needs_live_check("recommend a writing tool", false));
    }

    #[test]
    fn test_build_context_message_placeholders() {
        let message = build_context_message("Catalog snippet: empty.", None, None, None);
        assert!(message.contains("No user URL checks were performed"));
        assert!(message.contains("No live tool check was performed"));
        assert!(!message.contains("Pending enrichment"));

        let message = build_context_message(
            "Catalog snippet: empty.",
            Some("URL check results: ..."),
            Some("Live tool check results: ..."),
            Some("2 URL(s) captured for later enrichment."),
        );
        assert!(message.contains("URL check results"));
        assert!(message.contains("Live tool check results"));
        assert!(message.contains("Pending enrichment: 2 URL(s)"));
    }

    #[test]
    fn test_pipeline_error_responses() {
        let resp = PipelineError::RateLimitedChat {
            retry_after_secs: 7,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "7");

        assert_eq!(
            PipelineError::OriginBlocked.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            PipelineError::BodyTooLarge.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            PipelineError::InvalidPayload.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::NoRoutesConfigured.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            PipelineError::AllRoutesFailed.into_response().status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_live_tools_context_block() {
        let items = normalize_tool_items(
            &serde_json::json!({"items": [{
                "url": "https://example.com/t",
                "name": "ToolOne",
                "description": "AI writing assistant",
            }]}),
            NormalizeLimits::default(),
        );
        let block = live_tools_context(&items);
        assert!(block.starts_with("Live tool check results:"));
        assert!(block.contains("ToolOne"));
        assert!(block.contains("AI writing assistant"));
    }
}
