use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Sweep period for lapsed holds.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// How often the compactor checks the journal's growth.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep: release every Pending hold past its expiry. Returns how many were released.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = engine.settings().clock.now_ms();
    let mut released = 0;
    for (hold_id, room_id) in engine.collect_expired_holds(now) {
        match engine.release_hold(hold_id).await {
            Ok(true) => released += 1,
            Ok(false) => debug!("hold {hold_id} on room {room_id} settled before reaping"),
            Err(e) => debug!("reaper skip {hold_id}: {e}"),
        }
    }
    released
}

/// Background task that releases expired holds every `period`.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let released = reap_once(&engine).await;
        if released > 0 {
            info!("reaper released {released} expired holds");
        }
    }
}

/// Compact the journal once it has grown by `threshold` records. Returns
/// whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.journal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_journal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("journal compaction after {appends} appends failed: {e}");
            false
        }
    }
}

/// Background task that keeps the journal bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
