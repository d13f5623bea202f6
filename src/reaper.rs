use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::now_ms;

/// Background task that periodically drops expired holds, freeing their
/// slots and emitting `hold_expired` notifications. Read-side expiry
/// reconciliation already treats stale records as absent; this task just
/// keeps the store and the WAL from accumulating them.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

pub async fn reap_once(engine: &Engine) {
    let now = now_ms();
    for hold in engine.collect_expired_holds(now) {
        info!("reaping expired hold {} on {} {}", hold.token, hold.date, hold.slot);
        engine.expire_hold(&hold).await;
    }
}

/// Background task that compacts the WAL once hold/booking churn has
/// grown it past `threshold` appends.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
