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

//! Environment-driven configuration for all AicengHub services.
//!
//! Every recognized key has a default and, where the value is numeric, a
//! clamp range, so a partially configured environment degrades to sane
//! behavior instead of failing at startup.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Serialize;

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64_clamped(key: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on"
        ),
        Err(_) => default,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Upstream model routes
// ---------------------------------------------------------------------------

/// One upstream chat-completions route. Routes missing an API key or model
/// are dropped at load time.
#[derive(Debug, Clone, Serialize)]
pub struct RouteConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct RoutesConfig {
    /// Primary → secondary → tertiary, already filtered to usable routes.
    pub routes: Vec<RouteConfig>,
    pub http_referer: String,
    pub app_title: String,
}

const ROUTE_SLOTS: &[(&str, &str)] = &[
    ("PRIMARY", "deepseek/deepseek-chat-v3-0324:free"),
    ("SECONDARY", "meta-llama/llama-3.3-70b-instruct:free"),
    ("TERTIARY", "google/gemma-3-27b-it:free"),
];

impl RoutesConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut routes = Vec::new();
        for (slot, default_model) in ROUTE_SLOTS {
            let api_key = env_string(&format!("OPENROUTER_API_KEY_{slot}"));
            let model = env_string(&format!("OPENROUTER_MODEL_{slot}"))
                .unwrap_or_else(|| (*default_model).to_string());
            let label = env_string(&format!("OPENROUTER_LABEL_{slot}"))
                .unwrap_or_else(|| slot.to_ascii_lowercase());
            if let Some(api_key) = api_key {
                if !model.is_empty() {
                    routes.push(RouteConfig {
                        api_key,
                        model,
                        label,
                    });
                }
            }
        }
        Self {
            routes,
            http_referer: env_string("OPENROUTER_HTTP_REFERER")
                .unwrap_or_else(|| "https://aicenghub.com".to_string()),
            app_title: env_string("OPENROUTER_APP_TITLE")
                .unwrap_or_else(|| "AicengHub".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl ToolsConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("TOOLS_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: env_string("TOOLS_API_KEY"),
            timeout_ms: env_u64_clamped("TOOLS_TIMEOUT_MS", 6000, 1000, 20_000),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
}

impl StoreConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database_url: env_string("NEON_DATABASE_URL").or_else(|| env_string("DATABASE_URL")),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub verify_links: bool,
    pub capture_candidates: bool,
    pub audit_salt: String,
}

impl GatewayConfig {
    #[must_use]
    pub fn from_env() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let port = env_u64_clamped("JULEHA_PORT", 8087, 1, 65_535) as u16;
        Self {
            port,
            allowed_origins: env_csv("JULEHA_ALLOWED_ORIGINS"),
            verify_links: env_flag("JULEHA_VERIFY_LINKS", true),
            capture_candidates: env_flag("JULEHA_CAPTURE_CANDIDATES", true),
            audit_salt: env_string("JULEHA_AUDIT_SALT").unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub poll_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
}

impl WorkerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let max_attempts = env_u64_clamped("WORKER_MAX_ATTEMPTS", 5, 1, 20) as u32;
        Self {
            poll_ms: env_u64_clamped("WORKER_POLL_MS", 5000, 1000, 60_000),
            max_attempts,
            backoff_base_secs: env_u64_clamped("WORKER_BACKOFF_BASE_SEC", 60, 10, 3600),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// `None` means "pick a fresh random window in 24..=72 each run".
    pub stale_hours: Option<u64>,
    pub batch_size: u64,
}

impl SchedulerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let stale_hours = env_string("STALE_HOURS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|h| h.clamp(24, 72));
        Self {
            stale_hours,
            batch_size: env_u64_clamped("SCHEDULER_BATCH_SIZE", 200, 1, 5000),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
