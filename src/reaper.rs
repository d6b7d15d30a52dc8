use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that periodically deletes holds expired for longer than
/// `grace`. Capacity never depends on it: expired holds stop counting on
/// their own.
pub async fn run_hold_sweeper(engine: Arc<Engine>, every: Duration, grace: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep_expired_holds(grace).await {
            Ok(0) => {}
            Ok(n) => debug!("swept {n} expired holds"),
            Err(e) => warn!("hold sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(events) => info!(appends, events, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
