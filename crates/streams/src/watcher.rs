//! Periodic presence sweep.
//!
//! Catches channels whose last subscriber left without a matching
//! `release_stream` call, and drops idle entries from the registry.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{orchestrator::Shared, supervisor::StreamState};

/// One pass over the registry. Returns the number of channels scheduled for
/// teardown or stopped outright.
pub(crate) async fn sweep_presence(shared: &Arc<Shared>) -> usize {
    let mut scheduled = 0;
    let mut pruned = 0;
    shared.prune_detached();

    for entry in shared.entries() {
        match entry.state() {
            StreamState::Running | StreamState::Backoff => {
                // Busy entries are mid-transition; look again next tick.
                let Ok(slot) = entry.slot.try_lock() else {
                    continue;
                };
                if slot.handle.is_none() || slot.teardown.is_some() {
                    continue;
                }
                drop(slot);

                match shared.presence.subscriber_count(&entry.channel).await {
                    Ok(0) => {
                        if shared.stop_backoff(&entry).await
                            || shared.schedule_teardown(&entry).await
                        {
                            scheduled += 1;
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!(channel = %entry.channel, error = %e, "presence lookup failed during sweep");
                    },
                }
            },
            StreamState::Idle => {
                let Ok(mut slot) = entry.slot.try_lock() else {
                    continue;
                };
                if slot.is_vacant() {
                    shared.retire_locked(&entry, &mut slot);
                    pruned += 1;
                }
            },
            StreamState::Resolving | StreamState::Stopping => {},
        }
    }

    if scheduled > 0 || pruned > 0 {
        debug!(scheduled, pruned, "presence sweep finished");
    }
    scheduled
}

pub(crate) async fn run_presence_watcher(shared: Arc<Shared>, every: Duration) {
    info!(interval_ms = every.as_millis() as u64, "presence watcher started");
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shared.root.cancelled() => break,
            _ = ticker.tick() => {
                sweep_presence(&shared).await;
            },
        }
    }
    debug!("presence watcher stopped");
}
