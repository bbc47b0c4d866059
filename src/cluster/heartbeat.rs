//! Periodic shard health checks.
//!
//! One task per registry pings every shard on each tick, feeds the outcome to
//! the shard's vote, and rebuilds the ring once per sweep if any shard changed
//! state.

use super::registry::ShardRegistry;
use super::shard::Shard;
use crate::core::{Result, ShardError};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Level, debug, event, warn};

/// Probes one shard over its pool.
///
/// An exhausted pool means the shard is busy serving traffic, so it counts
/// as alive.
async fn probe(shard: &Shard) -> Result<()> {
    match shard.pool().ping().await {
        Ok(()) | Err(ShardError::PoolTimeout) => Ok(()),
        Err(err) => Err(ShardError::ProbeFailure(err.to_string())),
    }
}

/// Runs one health sweep over every shard. Returns whether the ring was rebuilt.
pub async fn sweep_once(registry: &ShardRegistry) -> bool {
    let mut changed = false;

    for shard in registry.list() {
        let outcome = probe(&shard).await;
        if !shard.vote(outcome.is_ok()) {
            continue;
        }
        changed = true;
        match outcome {
            Ok(()) => event!(Level::INFO, %shard, "shard state changed"),
            Err(err) => warn!(%shard, error = %err, "shard state changed"),
        }
    }

    if changed {
        registry.rebuild();
    }
    changed
}

/// Starts the heartbeat task for `registry`.
///
/// The task stops once the registry is closed.
pub fn spawn_heartbeat(registry: Arc<ShardRegistry>, frequency: Duration) -> JoinHandle<()> {
    let mut shutdown = registry.shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() || registry.is_closed() {
                break;
            }
            sweep_once(&registry).await;
        }

        debug!("heartbeat stopped");
    })
}
