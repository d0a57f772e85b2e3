/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Postgres link store: main catalog links, candidate links, the durable
//! scrape queue, tool-check audit rows, and rolling catalog backups.
//!
//! Concurrency contract: candidate upserts are serialized by the unique
//! index on `canonical_url` and written as single statements with
//! `CASE WHEN existing = '' …` conflict resolution, never read-modify-write.
//! Queue claims use `FOR UPDATE SKIP LOCKED` so multiple workers never
//! receive the same row.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

use aicenghub_catalog::{canonicalize_url, parse_tags, PricingTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Open a pool with the service-standard options.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainLink {
    pub id: i64,
    pub canonical_url: String,
    pub name: String,
    pub description: String,
    pub abilities: Vec<String>,
    pub pricing_tier: String,
    pub tags: Vec<String>,
    pub pricing_text: String,
    pub is_free: bool,
    pub has_trial: bool,
    pub is_paid: bool,
    pub favicon_url: String,
    pub thumbnail_url: String,
    pub pending_enrichment: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub source_label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a candidate-link observation.
#[derive(Debug, Clone, Default)]
pub struct CandidateUpsert {
    pub canonical_url: String,
    pub name: String,
    pub description: String,
    pub abilities: Vec<String>,
    pub pricing_tier: String,
    pub tags: Vec<String>,
    pub pricing_text: String,
    pub is_free: bool,
    pub has_trial: bool,
    pub is_paid: bool,
    pub final_url: String,
    pub http_status: Option<i32>,
    pub content_type: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub evidence_urls: Vec<String>,
    pub evidence: serde_json::Value,
    pub pending_enrichment: bool,
    pub discovered_by: String,
    pub submitter_ip_hash: String,
    pub submitter_session_hash: String,
    pub capture_reason: String,
}

/// Input for updating a main link from an enrichment observation.
#[derive(Debug, Clone, Default)]
pub struct MainLinkEnrichment {
    pub canonical_url: String,
    pub name: String,
    pub description: String,
    pub abilities: Vec<String>,
    pub pricing_tier: String,
    pub tags: Vec<String>,
    pub pricing_text: String,
    pub is_free: bool,
    pub has_trial: bool,
    pub is_paid: bool,
    pub favicon_url: String,
    pub thumbnail_url: String,
    pub pending_enrichment: bool,
}

#[derive(Debug, Clone)]
pub struct ToolCheckRecord {
    pub canonical_url: String,
    pub result: serde_json::Value,
    pub confidence: Option<f64>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueueJobInsert {
    pub canonical_url: String,
    pub requested_url: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// A queue row handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub canonical_url: String,
    pub requested_url: String,
    pub reason: String,
    pub attempts: i32,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub backup_slot: i32,
    pub inserted: u64,
    pub merged: u64,
    pub rejected: u64,
}

// ---------------------------------------------------------------------------
// Pure helpers (testable without a database)
// ---------------------------------------------------------------------------

/// Rolling backup slot in 1..=30: `(max_existing mod 30) + 1`.
#[must_use]
pub fn next_backup_slot(max_existing: i32) -> i32 {
    (max_existing.max(0) % 30) + 1
}

/// Quadratic retry backoff: `attempts² × base` seconds.
#[must_use]
pub fn retry_backoff_secs(attempts: u32, base_secs: u64) -> u64 {
    u64::from(attempts) * u64::from(attempts) * base_secs
}

/// Bound an error message for the `last_error` column.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= 2000 {
        return message.to_string();
    }
    message.chars().take(2000).collect()
}

fn clamp_confidence(confidence: Option<f64>) -> Option<f64> {
    confidence.map(|c| c.clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS main_links (
        id BIGSERIAL PRIMARY KEY,
        canonical_url TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        abilities TEXT[] NOT NULL DEFAULT '{}',
        pricing_tier TEXT NOT NULL DEFAULT 'trial',
        tags TEXT[] NOT NULL DEFAULT '{}',
        pricing_text TEXT NOT NULL DEFAULT '',
        is_free BOOLEAN NOT NULL DEFAULT FALSE,
        has_trial BOOLEAN NOT NULL DEFAULT FALSE,
        is_paid BOOLEAN NOT NULL DEFAULT FALSE,
        favicon_url TEXT NOT NULL DEFAULT '',
        thumbnail_url TEXT NOT NULL DEFAULT '',
        pending_enrichment BOOLEAN NOT NULL DEFAULT FALSE,
        last_checked_at TIMESTAMPTZ,
        source_label TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS main_links_canonical_url_key
        ON main_links (canonical_url)",
    "CREATE TABLE IF NOT EXISTS candidate_links (
        id BIGSERIAL PRIMARY KEY,
        canonical_url TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        abilities TEXT[] NOT NULL DEFAULT '{}',
        pricing_tier TEXT NOT NULL DEFAULT '',
        tags TEXT[] NOT NULL DEFAULT '{}',
        pricing_text TEXT NOT NULL DEFAULT '',
        is_free BOOLEAN NOT NULL DEFAULT FALSE,
        has_trial BOOLEAN NOT NULL DEFAULT FALSE,
        is_paid BOOLEAN NOT NULL DEFAULT FALSE,
        final_url TEXT NOT NULL DEFAULT '',
        http_status INTEGER,
        content_type TEXT NOT NULL DEFAULT '',
        verified_at TIMESTAMPTZ,
        evidence_urls TEXT[] NOT NULL DEFAULT '{}',
        evidence JSONB NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        discovered_count INTEGER NOT NULL DEFAULT 1,
        discovered_by TEXT NOT NULL DEFAULT '',
        submitter_ip_hash TEXT NOT NULL DEFAULT '',
        submitter_session_hash TEXT NOT NULL DEFAULT '',
        capture_reason TEXT NOT NULL DEFAULT '',
        pending_enrichment BOOLEAN NOT NULL DEFAULT FALSE,
        last_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        merged_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS candidate_links_canonical_url_key
        ON candidate_links (canonical_url)",
    "CREATE TABLE IF NOT EXISTS scrape_queue (
        id BIGSERIAL PRIMARY KEY,
        canonical_url TEXT NOT NULL,
        requested_url TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        next_run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        payload JSONB NOT NULL DEFAULT '{}',
        last_error TEXT NOT NULL DEFAULT '',
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS scrape_queue_claim_idx
        ON scrape_queue (status, next_run_at, created_at, id)",
    "CREATE TABLE IF NOT EXISTS tool_checks (
        id BIGSERIAL PRIMARY KEY,
        main_link_id BIGINT REFERENCES main_links(id),
        checked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        result JSONB NOT NULL DEFAULT '{}',
        confidence DOUBLE PRECISION,
        sources TEXT[] NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS link_backups (
        slot INTEGER PRIMARY KEY,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
];

/// Idempotent schema setup; safe to run at every service start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main links
// ---------------------------------------------------------------------------

fn main_link_from_row(row: &sqlx::postgres::PgRow) -> Result<MainLink, sqlx::Error> {
    Ok(MainLink {
        id: row.try_get("id")?,
        canonical_url: row.try_get("canonical_url")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        abilities: row.try_get("abilities")?,
        pricing_tier: row.try_get("pricing_tier")?,
        tags: row.try_get("tags")?,
        pricing_text: row.try_get("pricing_text")?,
        is_free: row.try_get("is_free")?,
        has_trial: row.try_get("has_trial")?,
        is_paid: row.try_get("is_paid")?,
        favicon_url: row.try_get("favicon_url")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        pending_enrichment: row.try_get("pending_enrichment")?,
        last_checked_at: row.try_get("last_checked_at")?,
        source_label: row.try_get("source_label")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// All main links ordered by lowercase name.
pub async fn get_main_links(pool: &PgPool) -> Result<Vec<MainLink>, StoreError> {
    let rows = sqlx::query("SELECT * FROM main_links ORDER BY LOWER(name) ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| main_link_from_row(row).map_err(StoreError::from))
        .collect()
}

/// Normalized set of main-link canonical URLs.
pub async fn get_main_url_set(pool: &PgPool) -> Result<HashSet<String>, StoreError> {
    let rows = sqlx::query("SELECT canonical_url FROM main_links")
        .fetch_all(pool)
        .await?;
    let mut set = HashSet::with_capacity(rows.len());
    for row in rows {
        let raw: String = row.try_get("canonical_url")?;
        if let Some(canonical) = canonicalize_url(&raw) {
            set.insert(canonical);
        }
    }
    Ok(set)
}

/// Apply an enrichment observation to a main link. String fields only
/// overwrite when the new value is non-empty; booleans and the checked
/// timestamp always overwrite.
pub async fn update_main_link_enrichment(
    pool: &PgPool,
    record: &MainLinkEnrichment,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE main_links SET
            name = CASE WHEN $2 = '' THEN name ELSE $2 END,
            description = CASE WHEN $3 = '' THEN description ELSE $3 END,
            abilities = CASE WHEN cardinality($4::text[]) = 0 THEN abilities ELSE $4 END,
            pricing_tier = CASE WHEN $5 = '' THEN pricing_tier ELSE $5 END,
            tags = CASE WHEN cardinality($6::text[]) = 0 THEN tags ELSE $6 END,
            pricing_text = CASE WHEN $7 = '' THEN pricing_text ELSE $7 END,
            is_free = $8,
            has_trial = $9,
            is_paid = $10,
            favicon_url = CASE WHEN $11 = '' THEN favicon_url ELSE $11 END,
            thumbnail_url = CASE WHEN $12 = '' THEN thumbnail_url ELSE $12 END,
            pending_enrichment = $13,
            last_checked_at = NOW(),
            updated_at = NOW()
         WHERE canonical_url = $1",
    )
    .bind(&record.canonical_url)
    .bind(&record.name)
    .bind(&record.description)
    .bind(&record.abilities)
    .bind(&record.pricing_tier)
    .bind(&record.tags)
    .bind(&record.pricing_text)
    .bind(record.is_free)
    .bind(record.has_trial)
    .bind(record.is_paid)
    .bind(&record.favicon_url)
    .bind(&record.thumbnail_url)
    .bind(record.pending_enrichment)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Re-canonicalize pricing tiers and tags across the catalog, touching only
/// rows whose stored values drift from the closed vocabularies.
pub async fn refresh_main_pricing_tiers(pool: &PgPool) -> Result<u64, StoreError> {
    let rows = sqlx::query("SELECT id, pricing_tier, tags FROM main_links")
        .fetch_all(pool)
        .await?;
    let mut changed = 0u64;
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let tier_raw: String = row.try_get("pricing_tier")?;
        let tags_raw: Vec<String> = row.try_get("tags")?;

        let tier = PricingTier::canonicalize(&tier_raw).as_str().to_string();
        let tags: Vec<String> = parse_tags(&tags_raw)
            .into_iter()
            .map(|t| t.as_str().to_string())
            .collect();

        if tier == tier_raw && tags == tags_raw {
            continue;
        }
        sqlx::query(
            "UPDATE main_links SET pricing_tier = $2, tags = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&tier)
        .bind(&tags)
        .execute(pool)
        .await?;
        changed += 1;
    }
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Candidate links
// ---------------------------------------------------------------------------

/// Insert or bump a candidate observation.
///
/// Single statement so concurrent observers serialize on the unique index:
/// string fields keep the first non-empty value, pricing flags and the
/// pending-enrichment marker always take the newest observation, counters
/// and seen-timestamps advance, and the lifecycle status returns to
/// `pending` on every sighting.
pub async fn upsert_candidate(pool: &PgPool, record: &CandidateUpsert) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO candidate_links (
            canonical_url, name, description, abilities, pricing_tier, tags,
            pricing_text, is_free, has_trial, is_paid, final_url, http_status,
            content_type, verified_at, evidence_urls, evidence, status,
            discovered_count, discovered_by, submitter_ip_hash,
            submitter_session_hash, capture_reason, pending_enrichment,
            last_seen_at, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
            $16, 'pending', 1, $17, $18, $19, $20, $21, NOW(), NOW(), NOW()
        )
        ON CONFLICT (canonical_url) DO UPDATE SET
            name = CASE WHEN candidate_links.name = ''
                THEN EXCLUDED.name ELSE candidate_links.name END,
            description = CASE WHEN candidate_links.description = ''
                THEN EXCLUDED.description ELSE candidate_links.description END,
            abilities = CASE WHEN cardinality(candidate_links.abilities) = 0
                THEN EXCLUDED.abilities ELSE candidate_links.abilities END,
            pricing_tier = CASE WHEN candidate_links.pricing_tier = ''
                THEN EXCLUDED.pricing_tier ELSE candidate_links.pricing_tier END,
            tags = CASE WHEN cardinality(candidate_links.tags) = 0
                THEN EXCLUDED.tags ELSE candidate_links.tags END,
            pricing_text = CASE WHEN candidate_links.pricing_text = ''
                THEN EXCLUDED.pricing_text ELSE candidate_links.pricing_text END,
            final_url = CASE WHEN candidate_links.final_url = ''
                THEN EXCLUDED.final_url ELSE candidate_links.final_url END,
            content_type = CASE WHEN candidate_links.content_type = ''
                THEN EXCLUDED.content_type ELSE candidate_links.content_type END,
            is_free = EXCLUDED.is_free,
            has_trial = EXCLUDED.has_trial,
            is_paid = EXCLUDED.is_paid,
            pending_enrichment = EXCLUDED.pending_enrichment,
            evidence_urls = EXCLUDED.evidence_urls,
            evidence = EXCLUDED.evidence,
            http_status = COALESCE(EXCLUDED.http_status, candidate_links.http_status),
            verified_at = GREATEST(candidate_links.verified_at, EXCLUDED.verified_at),
            status = 'pending',
            discovered_count = candidate_links.discovered_count + 1,
            last_seen_at = NOW(),
            updated_at = NOW()",
    )
    .bind(&record.canonical_url)
    .bind(&record.name)
    .bind(&record.description)
    .bind(&record.abilities)
    .bind(&record.pricing_tier)
    .bind(&record.tags)
    .bind(&record.pricing_text)
    .bind(record.is_free)
    .bind(record.has_trial)
    .bind(record.is_paid)
    .bind(&record.final_url)
    .bind(record.http_status)
    .bind(&record.content_type)
    .bind(record.verified_at)
    .bind(&record.evidence_urls)
    .bind(&record.evidence)
    .bind(&record.discovered_by)
    .bind(&record.submitter_ip_hash)
    .bind(&record.submitter_session_hash)
    .bind(&record.capture_reason)
    .bind(record.pending_enrichment)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tool checks
// ---------------------------------------------------------------------------

/// Append one audit row; joins to a main link when the canonical URL matches.
pub async fn insert_tool_check(pool: &PgPool, record: &ToolCheckRecord) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO tool_checks (main_link_id, checked_at, result, confidence, sources)
         VALUES (
            (SELECT id FROM main_links WHERE canonical_url = $1),
            NOW(), $2, $3, $4
         )",
    )
    .bind(&record.canonical_url)
    .bind(&record.result)
    .bind(clamp_confidence(record.confidence))
    .bind(&record.sources)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scrape queue
// ---------------------------------------------------------------------------

pub async fn enqueue_scrape_job(pool: &PgPool, job: &QueueJobInsert) -> Result<i64, StoreError> {
    let row = sqlx::query(
        "INSERT INTO scrape_queue
            (canonical_url, requested_url, reason, status, attempts, next_run_at, payload)
         VALUES ($1, $2, $3, 'pending', 0, COALESCE($4, NOW()), $5)
         RETURNING id",
    )
    .bind(&job.canonical_url)
    .bind(&job.requested_url)
    .bind(&job.reason)
    .bind(job.next_run_at)
    .bind(&job.payload)
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("id")?)
}

/// Claim the next eligible job, or `None` when the queue is drained.
///
/// Eligible: status in {pending, retry} with `next_run_at` due, oldest
/// first. The skip-locked subselect guarantees exactly one claimant even
/// under concurrent workers.
pub async fn claim_next_job(pool: &PgPool) -> Result<Option<ClaimedJob>, StoreError> {
    let row = sqlx::query(
        "UPDATE scrape_queue
         SET status = 'processing', started_at = NOW(), last_error = '', updated_at = NOW()
         WHERE id = (
            SELECT id FROM scrape_queue
            WHERE status IN ('pending', 'retry') AND next_run_at <= NOW()
            ORDER BY next_run_at ASC, created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
         )
         RETURNING id, canonical_url, requested_url, reason, attempts, payload",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(ClaimedJob {
        id: row.try_get("id")?,
        canonical_url: row.try_get("canonical_url")?,
        requested_url: row.try_get("requested_url")?,
        reason: row.try_get("reason")?,
        attempts: row.try_get("attempts")?,
        payload: row.try_get("payload")?,
    }))
}

pub async fn complete_job(pool: &PgPool, job_id: i64) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE scrape_queue
         SET status = 'done', finished_at = NOW(), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a job failure: terminal `failed` once attempts are exhausted,
/// otherwise `retry` with quadratic backoff.
pub async fn record_job_failure(
    pool: &PgPool,
    job_id: i64,
    new_attempts: u32,
    max_attempts: u32,
    backoff_base_secs: u64,
    error: &str,
) -> Result<(), StoreError> {
    let last_error = truncate_error(error);
    if new_attempts >= max_attempts {
        sqlx::query(
            "UPDATE scrape_queue
             SET status = 'failed', attempts = $2, last_error = $3,
                 finished_at = NOW(), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(i32::try_from(new_attempts).unwrap_or(i32::MAX))
        .bind(&last_error)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let backoff = retry_backoff_secs(new_attempts, backoff_base_secs);
    sqlx::query(
        "UPDATE scrape_queue
         SET status = 'retry', attempts = $2, last_error = $3,
             next_run_at = NOW() + ($4 * interval '1 second'), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(i32::try_from(new_attempts).unwrap_or(i32::MAX))
    .bind(&last_error)
    .bind(i64::try_from(backoff).unwrap_or(i64::MAX))
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Merge pass
// ---------------------------------------------------------------------------

/// Promote pending candidates into main links.
///
/// Runs in one transaction: snapshot the catalog into the next rolling
/// backup slot, then walk pending candidates in creation order, inserting
/// with conflict-do-nothing (URLs already in the catalog stay untouched) and
/// flipping each candidate to `merged`, or `rejected` when its URL no longer
/// normalizes.
pub async fn merge_pending_candidates(pool: &PgPool) -> Result<MergeOutcome, StoreError> {
    let mut tx = pool.begin().await?;

    let main_rows = sqlx::query("SELECT * FROM main_links ORDER BY id ASC")
        .fetch_all(&mut *tx)
        .await?;
    let snapshot: Vec<MainLink> = main_rows
        .iter()
        .map(main_link_from_row)
        .collect::<Result<_, _>>()?;

    let max_slot: i32 = sqlx::query("SELECT COALESCE(MAX(slot), 0) AS max_slot FROM link_backups")
        .fetch_one(&mut *tx)
        .await?
        .try_get("max_slot")?;
    let slot = next_backup_slot(max_slot);

    sqlx::query(
        "INSERT INTO link_backups (slot, payload, created_at)
         VALUES ($1, $2, NOW())
         ON CONFLICT (slot) DO UPDATE SET payload = EXCLUDED.payload, created_at = NOW()",
    )
    .bind(slot)
    .bind(serde_json::to_value(&snapshot)?)
    .execute(&mut *tx)
    .await?;

    let candidates = sqlx::query(
        "SELECT id, canonical_url, name, description, abilities, pricing_tier,
                tags, pricing_text, is_free, has_trial, is_paid, favicon_url,
                thumbnail_url, pending_enrichment
         FROM candidate_links
         WHERE status = 'pending'
         ORDER BY created_at ASC, id ASC",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut outcome = MergeOutcome {
        backup_slot: slot,
        ..MergeOutcome::default()
    };

    for candidate in candidates {
        let candidate_id: i64 = candidate.try_get("id")?;
        let raw_url: String = candidate.try_get("canonical_url")?;

        let Some(canonical) = canonicalize_url(&raw_url) else {
            sqlx::query(
                "UPDATE candidate_links
                 SET status = 'rejected', updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(candidate_id)
            .execute(&mut *tx)
            .await?;
            outcome.rejected += 1;
            continue;
        };

        let tier_raw: String = candidate.try_get("pricing_tier")?;
        let inserted = sqlx::query(
            "INSERT INTO main_links (
                canonical_url, name, description, abilities, pricing_tier,
                tags, pricing_text, is_free, has_trial, is_paid, favicon_url,
                thumbnail_url, pending_enrichment, source_label
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'candidate-merge')
             ON CONFLICT (canonical_url) DO NOTHING",
        )
        .bind(&canonical)
        .bind(candidate.try_get::<String, _>("name")?)
        .bind(candidate.try_get::<String, _>("description")?)
        .bind(candidate.try_get::<Vec<String>, _>("abilities")?)
        .bind(PricingTier::canonicalize(&tier_raw).as_str())
        .bind(candidate.try_get::<Vec<String>, _>("tags")?)
        .bind(candidate.try_get::<String, _>("pricing_text")?)
        .bind(candidate.try_get::<bool, _>("is_free")?)
        .bind(candidate.try_get::<bool, _>("has_trial")?)
        .bind(candidate.try_get::<bool, _>("is_paid")?)
        .bind(String::new())
        .bind(String::new())
        .bind(candidate.try_get::<bool, _>("pending_enrichment")?)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "UPDATE candidate_links
             SET status = 'merged', merged_at = NOW(), updated_at = NOW()
             WHERE id = $1",
        )
        .bind(candidate_id)
        .execute(&mut *tx)
        .await?;
        outcome.merged += 1;
        outcome.inserted += inserted;
    }

    tx.commit().await?;
    info!(
        backup_slot = outcome.backup_slot,
        merged = outcome.merged,
        inserted = outcome.inserted,
        rejected = outcome.rejected,
        "candidate merge pass complete"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Stale refresh
// ---------------------------------------------------------------------------

/// Enqueue `scheduled-refresh` jobs for main links whose last check is older
/// than `stale_hours` (or missing), oldest first, skipping URLs that already
/// have an in-flight job. One statement; the `NOT EXISTS` guard keeps the
/// queue free of duplicates.
pub async fn schedule_stale_refresh(
    pool: &PgPool,
    stale_hours: u64,
    batch_size: u64,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "INSERT INTO scrape_queue
            (canonical_url, requested_url, reason, status, attempts, next_run_at, payload)
         SELECT ml.canonical_url, ml.canonical_url, 'scheduled-refresh', 'pending', 0, NOW(), '{}'::jsonb
         FROM main_links ml
         WHERE (ml.last_checked_at IS NULL
                OR ml.last_checked_at < NOW() - ($1 || ' hours')::interval)
           AND NOT EXISTS (
                SELECT 1 FROM scrape_queue q
                WHERE q.canonical_url = ml.canonical_url
                  AND q.status IN ('pending', 'retry', 'processing')
           )
         ORDER BY ml.last_checked_at ASC NULLS FIRST
         LIMIT $2",
    )
    .bind(stale_hours.to_string())
    .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_slot_rolls_over() {
        assert_eq!(next_backup_slot(0), 1);
        assert_eq!(next_backup_slot(1), 2);
        assert_eq!(next_backup_slot(29), 30);
        assert_eq!(next_backup_slot(30), 1);
        assert_eq!(next_backup_slot(-3), 1);
    }

    #[test]
    fn test_retry_backoff_is_quadratic() {
        assert_eq!(retry_backoff_secs(1, 60), 60);
        assert_eq!(retry_backoff_secs(2, 60), 240);
        assert_eq!(retry_backoff_secs(3, 60), 540);
        assert_eq!(retry_backoff_secs(4, 10), 160);
    }

    #[test]
    fn test_truncate_error_bounds() {
        let long = "e".repeat(5000);
        assert_eq!(truncate_error(&long).chars().count(), 2000);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(Some(1.7)), Some(1.0));
        assert_eq!(clamp_confidence(Some(-0.2)), Some(0.0));
        assert_eq!(clamp_confidence(Some(0.42)), Some(0.42));
        assert_eq!(clamp_confidence(None), None);
    }

    #[test]
    fn test_schema_statements_are_idempotent_by_construction() {
        for statement in SCHEMA_STATEMENTS {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "schema statement must be rerunnable: {statement}"
            );
        }
    }

    #[test]
    fn test_main_link_snapshot_round_trips() {
        let link = MainLink {
            id: 7,
            canonical_url: "https://example.com/tool".to_string(),
            name: "Tool".to_string(),
            description: String::new(),
            abilities: vec!["text".to_string()],
            pricing_tier: "free".to_string(),
            tags: Vec::new(),
            pricing_text: String::new(),
            is_free: true,
            has_trial: false,
            is_paid: false,
            favicon_url: String::new(),
            thumbnail_url: String::new(),
            pending_enrichment: false,
            last_checked_at: None,
            source_label: "seed".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(vec![link.clone()]).unwrap();
        let back: Vec<MainLink> = serde_json::from_value(value).unwrap();
        assert_eq!(back[0].canonical_url, link.canonical_url);
        assert_eq!(back[0].pricing_tier, "free");
    }
}
