/*
 * AicengHub — guarded AI chat gateway and curated tool catalog
 * Copyright (C) 2025–2026 AicengHub contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Stale-refresh scheduler.
//!
//! One-shot binary meant to be invoked by a timer (cron/systemd). Enqueues
//! `scheduled-refresh` jobs for catalog links whose last check is older than
//! the stale window, bounded by the batch size, skipping URLs that already
//! have an in-flight job. When no window is configured, each run draws a
//! fresh one so refresh pressure spreads across invocations.

#![allow(clippy::module_name_repetitions)]

use std::process;

use aicenghub_config::{SchedulerConfig, StoreConfig};
use rand::Rng;
use tracing::{error, info};

const SERVICE_NAME: &str = "refresh-scheduler";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn effective_stale_hours(config: &SchedulerConfig) -> u64 {
    match config.stale_hours {
        Some(hours) => hours,
        None => rand::thread_rng().gen_range(24..=72),
    }
}

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

    let scheduler_cfg = SchedulerConfig::from_env();
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

    let stale_hours = effective_stale_hours(&scheduler_cfg);
    match aicenghub_store::schedule_stale_refresh(&pool, stale_hours, scheduler_cfg.batch_size)
        .await
    {
        Ok(enqueued) => {
            info!(
                stale_hours,
                batch_size = scheduler_cfg.batch_size,
                enqueued,
                "stale-refresh pass complete"
            );
        }
        Err(e) => {
            error!(error = %e, "stale-refresh pass failed");
            process::exit(1);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
