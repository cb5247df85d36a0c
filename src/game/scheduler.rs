//! Tick driver - one task per active match

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::matchmaking::SessionRegistry;

use super::r#match::{MatchHandle, TickOutcome};

/// Start the driver for a freshly activated match
pub fn spawn(
    handle: MatchHandle,
    registry: Arc<SessionRegistry>,
    tick_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(run(handle, registry, tick_interval))
}

/// Tick until the match is over or stopped, then tear it down.
///
/// Ticks of one match never overlap: this task is the only caller of
/// `Match::tick` for its match.
pub async fn run(handle: MatchHandle, registry: Arc<SessionRegistry>, tick_interval: Duration) {
    let key = handle.lock().key().clone();
    info!(match_key = %key, match_id = %handle.id, "Tick driver started");

    let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = handle.stopped() => {
                info!(match_key = %key, "Stop signal received");
                handle.lock().abort();
                break;
            }
        }

        let outcome = handle.lock().tick(Instant::now().into_std());
        match outcome {
            TickOutcome::Running => {}
            TickOutcome::Over(summary) => {
                info!(
                    match_key = %summary.key,
                    reason = ?summary.reason,
                    winner = summary.winner.as_deref().unwrap_or("draw"),
                    "Tick driver finished"
                );
                break;
            }
            TickOutcome::Idle => {
                warn!(match_key = %key, "Driver found an inactive match");
                break;
            }
        }
    }

    registry.teardown(&handle).await;
}
