use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::usage;

/// key: billing-usage-scheduler -> monthly counter rollover
///
/// The periodic trigger behind the monthly reset. Each tick seeds counters
/// for the current period; `reset_all_usage` is idempotent, so a tick that
/// fires twice for the same period (or a restart mid-month) changes nothing.
pub fn spawn(pool: PgPool, config: Arc<AppConfig>) {
    let interval = TokioDuration::from_secs(config.usage_reset_scan_interval_secs);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        let mut last_period = String::new();
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let period = usage::period_key(now);
            if period == last_period {
                continue;
            }
            match process_tick(&pool, &config, now).await {
                Ok(seeded) => {
                    info!(%period, seeded, "usage counters seeded for new period");
                    last_period = period;
                }
                Err(err) => warn!(?err, %period, "usage reset tick failed"),
            }
        }
    });
}

/// key: billing-usage-scheduler -> tick handler
pub async fn process_tick(pool: &PgPool, config: &AppConfig, now: DateTime<Utc>) -> Result<u64> {
    let period = usage::period_key(now);
    let seeded = usage::reset_all_usage(pool, config, &period).await?;
    Ok(seeded)
}
