use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::ConnectionRegistry;

/// Shortest sweep period accepted; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: usize,
}

/// Periodically pings every connection and evicts the ones that have gone
/// quiet for longer than `stale_timeout`.
///
/// Pongs are not awaited here: any inbound frame, pong included, refreshes
/// the connection's liveness through [`ConnectionRegistry::touch`].
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    stale_timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, stale_timeout: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_INTERVAL),
            stale_timeout,
        }
    }

    /// Run one pass over every registered connection.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();

        for (handle, last_liveness) in self.registry.liveness() {
            let silent_for = now.saturating_duration_since(last_liveness);
            if silent_for > self.stale_timeout {
                // Re-checked under the registry lock; a late touch wins
                if self.registry.evict_if_stale(handle.id(), now, self.stale_timeout) {
                    tracing::info!(
                        conn_id = %handle.id(),
                        silent_secs = silent_for.as_secs(),
                        "Heartbeat timeout"
                    );
                    report.evicted += 1;
                    continue;
                }
                if handle.is_closed() {
                    continue;
                }
            }

            match handle.try_send(Message::Ping(Default::default())) {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    tracing::warn!(conn_id = %handle.id(), error = %e, "Heartbeat probe failed");
                    if self.registry.evict(handle.id(), e.close_reason()) {
                        report.evicted += 1;
                    }
                }
            }
        }

        report
    }

    /// Sweep on every interval tick until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stale_timeout_secs = self.stale_timeout.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.evicted > 0 {
                        tracing::info!(probed = report.probed, evicted = report.evicted, "Heartbeat sweep");
                    } else {
                        tracing::debug!(probed = report.probed, "Heartbeat sweep");
                    }
                }
            }
        }

        tracing::info!("Heartbeat monitor stopped");
    }
}
