use std::sync::Arc;
use std::time::Duration;

use chrono::{Months, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::state::AppState;

/// How many events each consumer pass pulls from the durable feed.
const CONSUMER_BATCH_LIMIT: usize = 1000;

const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Session aggregator loop: tail new events, fold them into sessions, advance
/// the durable cursor. A failed pass is logged and retried on the next tick;
/// the cursor only moves after a committed batch, so nothing is skipped.
pub async fn run_session_aggregator(state: Arc<AppState>) {
    let gap = state.config.session_gap();
    let mut ticker = tokio::time::interval(state.config.worker_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match state
            .db
            .run_session_aggregation_once(gap, CONSUMER_BATCH_LIMIT)
            .await
        {
            Ok(0) => {}
            Ok(applied) => debug!(applied, "session aggregation pass"),
            Err(e) => error!("session aggregation pass failed: {e}"),
        }
    }
}

/// Rollup materializer loop: tail events and attribution records, rebuild the
/// touched (site, day) bucket slices, advance both cursors.
pub async fn run_rollup_materializer(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.worker_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match state.db.run_rollup_once(CONSUMER_BATCH_LIMIT).await {
            Ok(0) => {}
            Ok(rebuilt) => debug!(rebuilt, "rollup pass rebuilt day slices"),
            Err(e) => error!("rollup pass failed: {e}"),
        }
    }
}

/// Daily retention sweep: drop monthly partitions older than the configured
/// window. Runs once at startup, then every 24h.
pub async fn run_retention(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(before) = Utc::now().checked_sub_months(Months::new(state.config.retention_months))
        else {
            error!(
                retention_months = state.config.retention_months,
                "retention window underflows the calendar, skipping sweep"
            );
            continue;
        };
        match state.db.expire_partitions(before).await {
            Ok(dropped) if dropped.is_empty() => {}
            Ok(dropped) => info!(?dropped, "retention dropped expired partitions"),
            Err(e) => error!("retention sweep failed: {e}"),
        }
    }
}
