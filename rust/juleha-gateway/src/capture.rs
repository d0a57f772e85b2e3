/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Legacy URL verification and candidate capture.
//!
//! Verification runs the safe fetcher (HEAD, then GET on failure) behind a
//! per-request concurrency gate. Capture walks assistant output for links
//! the model itself flagged as outside the catalog, verifies them, probes
//! the landing page and well-known docs paths for title/description, and
//! persists candidates plus enrichment queue jobs.

use std::collections::HashSet;
use std::sync::Arc;

use aicenghub_catalog::{canonicalize_url, extract_urls, infer_abilities, pricing_flags_from_text};
use aicenghub_fetch::{
    extract_html_title, extract_meta_description, FetchConfig, SafeFetcher,
};
use aicenghub_store::{CandidateUpsert, QueueJobInsert};
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Per-request ceiling on outbound verification fetches in flight.
pub const FETCH_CONCURRENCY: usize = 3;

/// Marker the model puts on lines naming tools outside the catalog.
pub const EXTERNAL_TAG: &str = "external (not in aicenghub catalog)";

/// Most candidates captured from one assistant reply.
const MAX_CAPTURES: usize = 4;

const DOCS_SUFFIXES: &[&str] = &["/docs", "/documentation", "/help"];

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedLink {
    pub url: String,
    pub canonical_url: String,
    pub final_url: String,
    pub ok: bool,
    pub status: u16,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub note: String,
}

/// Verify one URL: HEAD first, falling back to GET when HEAD fails, with a
/// title pulled from HTML bodies. Fetch errors become per-link observations,
/// never request failures.
pub async fn verify_url(
    fetcher: &SafeFetcher,
    gate: &Arc<Semaphore>,
    url: &str,
) -> VerifiedLink {
    let canonical = canonicalize_url(url).unwrap_or_default();
    let _permit = match gate.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            return VerifiedLink {
                url: url.to_string(),
                canonical_url: canonical,
                final_url: String::new(),
                ok: false,
                status: 0,
                content_type: String::new(),
                title: None,
                note: "verification unavailable".to_string(),
            };
        }
    };

    let head = fetcher.fetch(url, FetchConfig::head()).await;
    let outcome = match head {
        Ok(outcome) if outcome.ok => Ok(outcome),
        _ => fetcher.fetch(url, FetchConfig::default()).await,
    };

    match outcome {
        Ok(outcome) => {
            let title = if outcome.content_type == "text/html" {
                extract_html_title(&outcome.body)
            } else {
                None
            };
            VerifiedLink {
                url: url.to_string(),
                canonical_url: canonical,
                final_url: outcome.final_url,
                ok: outcome.ok,
                status: outcome.status,
                content_type: outcome.content_type,
                title,
                note: if outcome.ok {
                    "reachable".to_string()
                } else {
                    format!("HTTP {}", outcome.status)
                },
            }
        }
        Err(e) => VerifiedLink {
            url: url.to_string(),
            canonical_url: canonical,
            final_url: String::new(),
            ok: false,
            status: 0,
            content_type: String::new(),
            title: None,
            note: e.code().to_string(),
        },
    }
}

/// System-message block summarizing user-URL verification for the model.
pub fn url_check_context(links: &[VerifiedLink]) -> String {
    let mut block = String::from("URL check results:");
    for link in links {
        let title = link.title.as_deref().unwrap_or("-");
        block.push_str(&format!(
            "\n- {} → {} (status {}, {}, title: {})",
            link.url,
            if link.ok { "reachable" } else { &link.note },
            link.status,
            if link.content_type.is_empty() {
                "unknown type"
            } else {
                &link.content_type
            },
            title,
        ));
    }
    block
}

// ---------------------------------------------------------------------------
// External-tagged line scan
// ---------------------------------------------------------------------------

/// Canonical URLs appearing on assistant lines carrying the external tag.
pub fn external_tagged_urls(text: &str) -> HashSet<String> {
    let mut tagged = HashSet::new();
    for line in text.lines() {
        if !line.to_lowercase().contains(EXTERNAL_TAG) {
            continue;
        }
        for url in extract_urls(line, 16) {
            if let Some(canonical) = canonicalize_url(&url) {
                tagged.insert(canonical);
            }
        }
    }
    tagged
}

/// Pick the capture targets from verified assistant links: the verified-ok
/// subset intersected with the external-tagged set when tags are present,
/// the whole verified-ok set otherwise, minus URLs already in the catalog,
/// bounded to [`MAX_CAPTURES`].
pub fn select_capture_targets(
    verified: &[VerifiedLink],
    tagged: &HashSet<String>,
    main_urls: &HashSet<String>,
) -> Vec<VerifiedLink> {
    verified
        .iter()
        .filter(|link| link.ok && !link.canonical_url.is_empty())
        .filter(|link| tagged.is_empty() || tagged.contains(&link.canonical_url))
        .filter(|link| !main_urls.contains(&link.canonical_url))
        .take(MAX_CAPTURES)
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Candidate capture
// ---------------------------------------------------------------------------

pub struct CaptureAudit {
    pub discovered_by: String,
    pub ip_hash: String,
    pub session_hash: String,
}

/// Probe the landing page plus docs suffixes for a title and description.
async fn probe_pages(
    fetcher: &SafeFetcher,
    gate: &Arc<Semaphore>,
    link: &VerifiedLink,
) -> (String, String, Vec<String>) {
    let mut title = link.title.clone().unwrap_or_default();
    let mut description = String::new();
    let mut evidence = vec![link.url.clone()];

    let mut targets = vec![link.url.clone()];
    targets.extend(
        DOCS_SUFFIXES
            .iter()
            .map(|suffix| format!("{}{suffix}", link.canonical_url)),
    );

    for target in targets {
        if !title.is_empty() && !description.is_empty() {
            break;
        }
        let Ok(permit) = gate.acquire().await else {
            break;
        };
        let fetched = fetcher.fetch(&target, FetchConfig::default()).await;
        drop(permit);
        match fetched {
            Ok(outcome) if outcome.ok && outcome.content_type == "text/html" => {
                if title.is_empty() {
                    if let Some(found) = extract_html_title(&outcome.body) {
                        title = found;
                    }
                }
                if description.is_empty() {
                    if let Some(found) = extract_meta_description(&outcome.body) {
                        description = found;
                    }
                }
                if !evidence.contains(&target) {
                    evidence.push(target);
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(url = %target, code = e.code(), "capture probe failed");
            }
        }
    }

    (title, description, evidence)
}

/// Persist capture targets as candidates and enqueue enrichment jobs.
/// Returns how many candidates were written.
pub async fn capture_candidates(
    pool: &PgPool,
    fetcher: &SafeFetcher,
    gate: &Arc<Semaphore>,
    targets: &[VerifiedLink],
    audit: &CaptureAudit,
) -> usize {
    let mut captured = 0usize;
    for link in targets {
        let (title, description, evidence) = probe_pages(fetcher, gate, link).await;
        let abilities: Vec<String> = infer_abilities(&format!("{title} {description}"))
            .into_iter()
            .map(|a| a.as_str().to_string())
            .collect();
        let flags = pricing_flags_from_text(&description);

        let candidate = CandidateUpsert {
            canonical_url: link.canonical_url.clone(),
            name: title,
            description,
            abilities,
            is_free: flags.is_free,
            has_trial: flags.has_trial,
            is_paid: flags.is_paid,
            final_url: link.final_url.clone(),
            http_status: Some(i32::from(link.status)),
            content_type: link.content_type.clone(),
            verified_at: Some(Utc::now()),
            evidence_urls: evidence,
            evidence: serde_json::json!({
                "note": link.note,
                "title": link.title,
            }),
            pending_enrichment: false,
            discovered_by: audit.discovered_by.clone(),
            submitter_ip_hash: audit.ip_hash.clone(),
            submitter_session_hash: audit.session_hash.clone(),
            capture_reason: "assistant-verified-link".to_string(),
            ..CandidateUpsert::default()
        };

        if let Err(e) = aicenghub_store::upsert_candidate(pool, &candidate).await {
            warn!(url = %link.canonical_url, error = %e, "candidate capture failed");
            continue;
        }
        if let Err(e) = aicenghub_store::enqueue_scrape_job(
            pool,
            &QueueJobInsert {
                canonical_url: link.canonical_url.clone(),
                requested_url: link.url.clone(),
                reason: "candidate-enrichment".to_string(),
                payload: serde_json::json!({"source": "assistant-verified-link"}),
                next_run_at: None,
            },
        )
        .await
        {
            warn!(url = %link.canonical_url, error = %e, "candidate enqueue failed");
        }
        captured += 1;
    }
    captured
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_link(url: &str) -> VerifiedLink {
        VerifiedLink {
            url: url.to_string(),
            canonical_url: canonicalize_url(url).unwrap(),
            final_url: url.to_string(),
            ok: true,
            status: 200,
            content_type: "text/html".to_string(),
            title: None,
            note: "reachable".to_string(),
        }
    }

    #[test]
    fn test_external_tagged_urls_case_insensitive() {
        let text = "Try these:\n\
            - https://known.example — in catalog\n\
            - https://fresh.example — EXTERNAL (Not In AicengHub Catalog)\n\
            - https://other.example external (not in aicenghub catalog)";
        let tagged = external_tagged_urls(text);
        assert!(tagged.contains("https://fresh.example"));
        assert!(tagged.contains("https://other.example"));
        assert!(!tagged.contains("https://known.example"));
    }

    #[test]
    fn test_select_targets_intersects_with_tags() {
        let verified = vec![ok_link("https://a.example"), ok_link("https://b.example")];
        let tagged: HashSet<String> = ["https://b.example".to_string()].into_iter().collect();
        let main = HashSet::new();
        let targets = select_capture_targets(&verified, &tagged, &main);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].canonical_url, "https://b.example");
    }

    #[test]
    fn test_select_targets_full_ok_set_without_tags() {
        let verified = vec![ok_link("https://a.example"), ok_link("https://b.example")];
        let targets = select_capture_targets(&verified, &HashSet::new(), &HashSet::new());
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_select_targets_drops_known_and_failed() {
        let mut failed = ok_link("https://down.example");
        failed.ok = false;
        let verified = vec![
            ok_link("https://known.example"),
            failed,
            ok_link("https://new.example"),
        ];
        let main: HashSet<String> = ["https://known.example".to_string()].into_iter().collect();
        let targets = select_capture_targets(&verified, &HashSet::new(), &main);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].canonical_url, "https://new.example");
    }

    #[test]
    fn test_select_targets_bounded() {
        let verified: Vec<VerifiedLink> = (0..10)
            .map(|i| ok_link(&format!("https://t{i}.example")))
            .collect();
        let targets = select_capture_targets(&verified, &HashSet::new(), &HashSet::new());
        assert_eq!(targets.len(), MAX_CAPTURES);
    }

    #[test]
    fn test_url_check_context_lists_each_link() {
        let mut bad = ok_link("https://down.example");
        bad.ok = false;
        bad.note = "blocked-ip".to_string();
        let block = url_check_context(&[ok_link("https://up.example"), bad]);
        assert!(block.starts_with("URL check results:"));
        assert!(block.contains("https://up.example → reachable"));
        assert!(block.contains("https://down.example → blocked-ip"));
    }
}
