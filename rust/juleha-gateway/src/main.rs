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

//! Juleha chat gateway.
//!
//! Exposes:
//! - `POST /juleha-chat` — the guarded chat pipeline
//! - `GET  /health`      — liveness with store/tools/routes probes
//!
//! A missing or unreachable store degrades the pipeline (no candidate
//! capture, stub catalog context) instead of failing requests.

#![allow(clippy::module_name_repetitions)]

mod capture;
mod pipeline;
mod prompts;
mod sanitize;
mod upstream;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use aicenghub_config::{GatewayConfig, RoutesConfig, StoreConfig, ToolsConfig};
use aicenghub_fetch::SafeFetcher;
use aicenghub_runtime::RateLimiter;
use aicenghub_tools::ToolsClient;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "juleha-gateway";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: GatewayConfig,
    pub routes: RoutesConfig,
    pub tools: ToolsClient,
    /// `None` when no database is configured or reachable; the pipeline
    /// degrades instead of failing.
    pub pool: Option<PgPool>,
    pub fetcher: SafeFetcher,
    pub limiter: RateLimiter,
    pub upstream: reqwest::Client,
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

    let config = GatewayConfig::from_env();
    let routes = RoutesConfig::from_env();
    let tools_cfg = ToolsConfig::from_env();
    let store_cfg = StoreConfig::from_env();

    if routes.routes.is_empty() {
        warn!("no upstream routes configured — chat requests will return 500");
    }
    if config.audit_salt.is_empty() {
        warn!("JULEHA_AUDIT_SALT is empty — audit hashes are unsalted");
    }

    let pool = match &store_cfg.database_url {
        Some(url) => match aicenghub_store::connect(url).await {
            Ok(pool) => {
                if let Err(e) = aicenghub_store::ensure_schema(&pool).await {
                    error!(error = %e, "fatal: schema setup failed");
                    process::exit(1);
                }
                info!("postgres pool connected");
                Some(pool)
            }
            Err(e) => {
                warn!(error = %e, "store unreachable — running degraded");
                None
            }
        },
        None => {
            warn!("no database configured — running degraded");
            None
        }
    };

    let tools = match ToolsClient::from_config(&tools_cfg) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "fatal: failed to build tools client");
            process::exit(1);
        }
    };
    let fetcher = match SafeFetcher::new() {
        Ok(fetcher) => fetcher,
        Err(e) => {
            error!(error = %e, "fatal: failed to build safe fetcher");
            process::exit(1);
        }
    };
    let upstream = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "fatal: failed to build upstream client");
            process::exit(1);
        }
    };

    let cors = if config.allowed_origins.is_empty() {
        warn!("JULEHA_ALLOWED_ORIGINS is empty — same-origin only");
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    } else {
        let parsed: Vec<header::HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        routes,
        tools,
        pool,
        fetcher,
        limiter: RateLimiter::new(),
        upstream,
    });

    let app = Router::new()
        .route("/juleha-chat", post(pipeline::juleha_chat))
        .route("/health", get(health_handler))
        // Outer buffering bound only; the pipeline enforces the 64 KiB
        // contract itself so oversized bodies get its JSON error shape.
        .layer(DefaultBodyLimit::max(2 * pipeline::MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "juleha gateway listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "fatal: failed to bind listener");
            process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(aicenghub_runtime::shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
    }
    info!("shutdown complete");
}

// ---------------------------------------------------------------------------
// Security headers middleware
// ---------------------------------------------------------------------------

async fn security_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "Cache-Control",
        header::HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
    );
    headers.insert("Pragma", header::HeaderValue::from_static("no-cache"));
    headers.insert(
        "X-Content-Type-Options",
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Permissions-Policy",
        header::HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    resp
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = match &state.pool {
        Some(pool) => sqlx::query("SELECT 1").execute(pool).await.is_ok(),
        None => false,
    };
    let status = if db_ok { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "db_ok": db_ok,
        "routes_configured": state.routes.routes.len(),
    }))
}
