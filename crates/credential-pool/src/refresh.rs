//! Proactive background credential refresh
//!
//! Spawns a periodic task that refreshes slots approaching expiration, so
//! most `acquire` calls find a fresh credential and never wait on the token
//! service. Runs independently of the polling tasks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::pool::Pool;

/// Spawn a background task that proactively refreshes expiring credentials.
///
/// Runs every `interval` and refreshes any slot that is empty or expires
/// within `threshold`. Failures leave the slot as it was; the next cycle
/// (or a task's `acquire`) tries again.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, slots were just seeded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, threshold).await;
        }
    })
}

/// Run one refresh cycle over every slot.
async fn refresh_cycle(pool: &Pool, threshold: Duration) {
    let (refreshed, failed) = pool.refresh_expiring(threshold).await;
    if refreshed > 0 || failed > 0 {
        info!(refreshed, failed, "background credential refresh cycle");
    } else {
        debug!("no credentials near expiry");
    }
}
