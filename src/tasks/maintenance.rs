//! Maintenance Task
//!
//! Background task that periodically sweeps expired entries from both tiers
//! and logs cache statistics, until shutdown is signalled.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::TieredCache;

/// Shortest accepted period; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Spawns the maintenance loop.
///
/// Runs a sweep every `sweep_interval` and a statistics report every
/// `stats_interval`. The first of each happens one full period after start.
/// The loop exits once `shutdown` turns true or its sender is dropped.
///
/// # Arguments
/// * `cache` - the cache to maintain
/// * `sweep_interval` - period between expiry sweeps
/// * `stats_interval` - period between statistics reports
/// * `shutdown` - receiver flipped to true by [`TieredCache::close`]
pub fn spawn_maintenance_task(
    cache: TieredCache,
    sweep_interval: Duration,
    stats_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting maintenance task (sweep every {:?}, stats every {:?})",
            sweep_interval, stats_interval
        );

        let mut sweep = tokio::time::interval(sweep_interval.max(MIN_PERIOD));
        let mut report = tokio::time::interval(stats_interval.max(MIN_PERIOD));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // first tick fires immediately
        sweep.tick().await;
        report.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let outcome = cache.run_maintenance().await;
                    if outcome.expired > 0 || outcome.persistent_purged.unwrap_or(0) > 0 {
                        info!(
                            "Maintenance: removed {} expired entries, purged {:?} durable records",
                            outcome.expired, outcome.persistent_purged
                        );
                    } else {
                        debug!("Maintenance: nothing to remove");
                    }
                }
                _ = report.tick() => {
                    cache.report_stats().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Maintenance task stopping");
    })
}
