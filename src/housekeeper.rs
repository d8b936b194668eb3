//! Periodic message-expiry task.
//!
//! One recurring scan over a snapshot of all local queues, at a fixed
//! interval from broker startup. The stop signal is checked between queues,
//! never mid-queue, so shutdown is not blocked by a long scan.

use crate::protocol::now_millis;
use crate::queue::LocalQueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub fn spawn(
    local: Arc<LocalQueueManager>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first scan runs
        // one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_millis();
                    let mut removed = 0usize;
                    for queue in local.queues_snapshot() {
                        if stop_requested(&mut shutdown_rx) {
                            info!("housekeeper stopping mid-scan");
                            return;
                        }
                        removed += queue.expire(now);
                    }
                    if removed > 0 {
                        info!(removed, "housekeeper expired messages");
                    } else {
                        debug!("housekeeper pass complete, nothing expired");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("housekeeper stopped");
                    return;
                }
            }
        }
    })
}

fn stop_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}
