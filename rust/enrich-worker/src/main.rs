/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Enrichment queue worker.
//!
//! Long-running loop: claim one job (skip-locked), enrich the requested URL
//! through the tools service, apply the observation to the candidate row
//! (always) and the matching main link (if any), append a tool-check audit
//! row, and complete the job. Failures reschedule with quadratic backoff
//! until attempts are exhausted.

#![allow(clippy::module_name_repetitions)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use aicenghub_catalog::{normalize_tool_items, NormalizeLimits, ToolItem};
use aicenghub_config::{StoreConfig, ToolsConfig, WorkerConfig};
use aicenghub_store::{
    CandidateUpsert, ClaimedJob, MainLinkEnrichment, StoreError, ToolCheckRecord,
};
use aicenghub_tools::{ToolsClient, ToolsError};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "enrich-worker";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Queue-enrichment responses may carry a few more evidence links than the
/// interactive pipeline keeps.
const WORKER_MAX_SOURCES: usize = 12;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Tools(#[from] ToolsError),
}

impl WorkerError {
    /// Discriminator persisted into `last_error`.
    fn code(&self) -> String {
        match self {
            WorkerError::Store(_) => "worker-failed".to_string(),
            WorkerError::Tools(e) => e.code(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    aicenghub_runtime::load_dotenv();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main());
}

async fn async_main() {
    aicenghub_runtime::init_logging();
    info!(service = SERVICE_NAME, version = SERVICE_VERSION, "starting");

    let worker_cfg = WorkerConfig::from_env();
    let tools_cfg = ToolsConfig::from_env();
    let store_cfg = StoreConfig::from_env();

    let Some(database_url) = store_cfg.database_url else {
        error!("fatal: no database configured (NEON_DATABASE_URL / DATABASE_URL)");
        process::exit(1);
    };

    let pool = match aicenghub_store::connect(&database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "fatal: failed to connect to Postgres");
            process::exit(1);
        }
    };
    if let Err(e) = aicenghub_store::ensure_schema(&pool).await {
        error!(error = %e, "fatal: schema setup failed");
        process::exit(1);
    }

    let tools = match ToolsClient::from_config(&tools_cfg) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "fatal: failed to build tools client");
            process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = {
        let pool = pool.clone();
        let tools = Arc::clone(&tools);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            poll_loop(&pool, &tools, worker_cfg, rx).await;
        })
    };

    aicenghub_runtime::shutdown_signal().await;
    info!("shutdown signal received, stopping poll loop");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(15), loop_handle).await {
        Ok(Ok(())) => info!("poll loop stopped cleanly"),
        Ok(Err(e)) => warn!(error = %e, "poll loop task panicked"),
        Err(_) => warn!("poll loop did not stop within 15s, forcing shutdown"),
    }
    info!("shutdown complete");
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn poll_loop(
    pool: &PgPool,
    tools: &ToolsClient,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        poll_ms = config.poll_ms,
        max_attempts = config.max_attempts,
        backoff_base_secs = config.backoff_base_secs,
        "queue poll loop started"
    );

    loop {
        if *shutdown.borrow() {
            info!("poll loop received shutdown");
            break;
        }

        let claimed = match aicenghub_store::claim_next_job(pool).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "queue claim failed");
                None
            }
        };

        if let Some(job) = claimed {
            handle_job(pool, tools, &config, &job).await;
            // Drain the queue without sleeping while work is available.
            continue;
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(config.poll_ms)) => {}
            _ = shutdown.changed() => {
                info!("poll loop received shutdown during sleep");
                break;
            }
        }
    }

    info!("poll loop exited");
}

async fn handle_job(pool: &PgPool, tools: &ToolsClient, config: &WorkerConfig, job: &ClaimedJob) {
    info!(
        job_id = job.id,
        url = %job.requested_url,
        reason = %job.reason,
        attempts = job.attempts,
        "processing queue job"
    );

    match run_job(pool, tools, job).await {
        Ok(applied) => {
            if let Err(e) = aicenghub_store::complete_job(pool, job.id).await {
                error!(job_id = job.id, error = %e, "failed to mark job done");
                return;
            }
            info!(job_id = job.id, items = applied, "job done");
        }
        Err(e) => {
            let new_attempts = u32::try_from(job.attempts).unwrap_or(0) + 1;
            let exhausted = new_attempts >= config.max_attempts;
            if exhausted {
                warn!(
                    job_id = job.id,
                    attempts = new_attempts,
                    error = %e,
                    "max attempts reached, marking job failed"
                );
            } else {
                warn!(
                    job_id = job.id,
                    attempts = new_attempts,
                    error = %e,
                    "job failed, scheduling retry"
                );
            }
            let message = format!("{}: {e}", e.code());
            if let Err(store_err) = aicenghub_store::record_job_failure(
                pool,
                job.id,
                new_attempts,
                config.max_attempts,
                config.backoff_base_secs,
                &message,
            )
            .await
            {
                error!(job_id = job.id, error = %store_err, "failed to record job failure");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One job end-to-end
// ---------------------------------------------------------------------------

async fn run_job(pool: &PgPool, tools: &ToolsClient, job: &ClaimedJob) -> Result<usize, WorkerError> {
    let response = tools.enrich(&job.requested_url, "queue-enrichment").await?;
    let items = normalize_tool_items(
        &response,
        NormalizeLimits {
            max_sources: WORKER_MAX_SOURCES,
        },
    );
    if items.is_empty() {
        return Err(WorkerError::Tools(ToolsError::EmptyEnrichment));
    }

    for item in &items {
        apply_enrichment(pool, job, item).await?;
    }
    Ok(items.len())
}

/// Apply one normalized item: candidate row always, main link when one
/// matches, and an audit row either way. Keyed by canonical URL, so
/// reapplying the same item is safe.
async fn apply_enrichment(
    pool: &PgPool,
    job: &ClaimedJob,
    item: &ToolItem,
) -> Result<(), WorkerError> {
    let abilities: Vec<String> = item
        .abilities
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    let tags: Vec<String> = item.tags.iter().map(|t| t.as_str().to_string()).collect();

    aicenghub_store::upsert_candidate(
        pool,
        &CandidateUpsert {
            canonical_url: item.canonical_url.clone(),
            name: item.name.clone(),
            description: item.description.clone(),
            abilities: abilities.clone(),
            pricing_tier: item.pricing_tier.as_str().to_string(),
            tags: tags.clone(),
            pricing_text: item.pricing_text.clone(),
            is_free: item.flags.is_free,
            has_trial: item.flags.has_trial,
            is_paid: item.flags.is_paid,
            final_url: item.final_url.clone(),
            content_type: item.content_type.clone(),
            evidence_urls: item.sources.clone(),
            evidence: serde_json::json!({
                "reason": job.reason,
                "requestedUrl": job.requested_url,
            }),
            pending_enrichment: false,
            discovered_by: SERVICE_NAME.to_string(),
            capture_reason: job.reason.clone(),
            ..CandidateUpsert::default()
        },
    )
    .await?;

    let updated_main = aicenghub_store::update_main_link_enrichment(
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
    .await?;

    aicenghub_store::insert_tool_check(
        pool,
        &ToolCheckRecord {
            canonical_url: item.canonical_url.clone(),
            result: serde_json::json!({
                "name": item.name,
                "description": item.description,
                "pricingTier": item.pricing_tier.as_str(),
                "reason": job.reason,
                "mainLinkUpdated": updated_main,
            }),
            confidence: item.confidence,
            sources: item.sources.clone(),
        },
    )
    .await?;

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_codes() {
        let e = WorkerError::Tools(ToolsError::Timeout);
        assert_eq!(e.code(), "tools-timeout");
        let e = WorkerError::Tools(ToolsError::EmptyEnrichment);
        assert_eq!(e.code(), "tools-enrich-empty");
        let e = WorkerError::Tools(ToolsError::Http(502));
        assert_eq!(e.code(), "tools-http-502");
    }

    #[test]
    fn test_empty_normalization_is_an_error() {
        let items = normalize_tool_items(
            &serde_json::json!({"items": []}),
            NormalizeLimits {
                max_sources: WORKER_MAX_SOURCES,
            },
        );
        assert!(items.is_empty());
    }

    #[test]
    fn test_worker_source_bound_is_wider_than_pipeline() {
        assert!(WORKER_MAX_SOURCES > NormalizeLimits::default().max_sources);
    }
}
