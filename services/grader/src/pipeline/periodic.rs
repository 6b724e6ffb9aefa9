//! Cancellable fixed-rate background tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs `tick` every `period` until `token` is cancelled.
///
/// The first tick fires one full period after spawning.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "Periodic task stopped.");
    })
}
