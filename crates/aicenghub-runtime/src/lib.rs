/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for AicengHub services.
//!
//! Provides common building blocks that would otherwise be duplicated
//! across services:
//! - [`init_logging`]: structured JSON tracing with env-filter
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`load_dotenv`]: best-effort `.env` loader for local runs
//! - [`RateLimiter`]: in-process fixed-window token buckets

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber: env-filter (default `info`) plus a
/// JSON fmt layer with target and thread ids. Call once per process.
pub fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

// ---------------------------------------------------------------------------
// .env loader
// ---------------------------------------------------------------------------

/// Load a `.env` file into the process environment.
///
/// Must be called from `main()` before the tokio runtime is built: `set_var`
/// is only sound while the process is still single-threaded.
pub fn load_dotenv() {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            std::env::set_var(key.trim(), val.trim());
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` or `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Rate limiter (fixed-window buckets per key)
// ---------------------------------------------------------------------------

/// Soft cap on tracked buckets; expired entries are swept once exceeded.
const BUCKET_SOFT_CAP: usize = 8000;

struct WindowBucket {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Outcome of a [`RateLimiter::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
    pub reset_at: DateTime<Utc>,
}

/// In-process fixed-window limiter keyed by string.
///
/// State is process-local by design: deployments run behind a single entry
/// point per region, so running N instances multiplies the effective global
/// rate by N. A stricter global limit needs a shared store.
#[derive(Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, WindowBucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `weight` units from the bucket `key` limited to `limit` per
    /// `window_ms`. Misconfiguration (empty key, zero limit or window)
    /// fails open: the call is allowed and nothing is recorded.
    pub async fn consume(
        &self,
        key: &str,
        limit: u64,
        window_ms: i64,
        weight: u64,
    ) -> LimitDecision {
        let now = Utc::now();
        if key.is_empty() || limit == 0 || window_ms <= 0 {
            return LimitDecision {
                allowed: true,
                remaining: limit,
                retry_after_secs: 0,
                reset_at: now,
            };
        }

        let mut buckets = self.buckets.write().await;

        if buckets.len() > BUCKET_SOFT_CAP {
            buckets.retain(|_, bucket| bucket.reset_at > now);
        }

        let window = ChronoDuration::milliseconds(window_ms);
        let bucket = buckets.entry(key.to_string()).or_insert(WindowBucket {
            count: 0,
            reset_at: now + window,
        });
        if bucket.reset_at <= now {
            bucket.count = 0;
            bucket.reset_at = now + window;
        }

        if bucket.count + weight > limit {
            let millis_left = (bucket.reset_at - now).num_milliseconds().max(0);
            #[allow(clippy::cast_sign_loss)]
            let retry_after_secs = ((millis_left as u64) + 999) / 1000;
            return LimitDecision {
                allowed: false,
                remaining: limit.saturating_sub(bucket.count),
                retry_after_secs: retry_after_secs.max(1),
                reset_at: bucket.reset_at,
            };
        }

        bucket.count += weight;
        LimitDecision {
            allowed: true,
            remaining: limit.saturating_sub(bucket.count),
            retry_after_secs: 0,
            reset_at: bucket.reset_at,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_limiter_allows_within_limit() {
        let rl = RateLimiter::new();
        for i in 0..5 {
            let d = rl.consume("a", 5, 60_000, 1).await;
            assert!(d.allowed, "call {i} should be allowed");
        }
        let d = rl.consume("a", 5, 60_000, 1).await;
        assert!(!d.allowed);
        assert!(d.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn test_limiter_weighted_boundary() {
        let rl = RateLimiter::new();
        let d = rl.consume("key", 10, 60_000, 10).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
        let d = rl.consume("key", 10, 60_000, 1).await;
        assert!(!d.allowed);
        assert!(d.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn test_limiter_keys_are_independent() {
        let rl = RateLimiter::new();
        let _ = rl.consume("x", 1, 60_000, 1).await;
        let d = rl.consume("y", 1, 60_000, 1).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_limiter_fails_open_on_misconfiguration() {
        let rl = RateLimiter::new();
        let d = rl.consume("", 5, 60_000, 1).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
        assert_eq!(d.retry_after_secs, 0);

        let d = rl.consume("k", 0, 60_000, 1).await;
        assert!(d.allowed);

        let d = rl.consume("k", 5, 0, 1).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_limiter_window_resets() {
        let rl = RateLimiter::new();
        let d = rl.consume("w", 1, 1, 1).await;
        assert!(d.allowed);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let d = rl.consume("w", 1, 1, 1).await;
        assert!(d.allowed, "expired window should reset the bucket");
    }
}
