//! Background idle sweeper
//!
//! Holds only a weak reference so a dropped pool ends the task.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PoolInner;
use crate::transport::Connector;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(super) fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

pub(super) fn spawn<C: Connector>(
    pool: Weak<PoolInner<C>>,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.sweep_idle().await;
        }

        debug!("Idle sweeper stopped");
    })
}
