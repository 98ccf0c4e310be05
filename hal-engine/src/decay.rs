use crate::apprehension::ApprehensionStore;
use crate::clock::{Clock, ReadyGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Periodically relaxes every channel's mute level.
///
/// Nothing decays until the ready gate opens. The first tick lands one full
/// period after that, and a tick that overruns is skipped rather than
/// bunched, so two decays never overlap.
#[derive(Clone)]
pub struct DecayTicker {
    store: Arc<ApprehensionStore>,
    gate: ReadyGate,
    clock: Arc<dyn Clock>,
    period: Duration,
    amount: i64,
}

impl DecayTicker {
    pub fn new(
        store: Arc<ApprehensionStore>,
        gate: ReadyGate,
        clock: Arc<dyn Clock>,
        period: Duration,
        amount: i64,
    ) -> Self {
        Self {
            store,
            gate,
            clock,
            period,
            amount,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("apprehension decay stopped before ready");
                return;
            }
            _ = self.gate.wait() => {}
        }

        tracing::info!(
            decay_period_secs = self.period.as_secs(),
            decay_amount = self.amount,
            "apprehension decay started"
        );
        let mut next = self.clock.now() + self.period;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("apprehension decay received shutdown signal");
                    break;
                }
                _ = self.clock.sleep_until(next) => {
                    let tracked = self.store.len();
                    let unmuted = self.store.decay_all(self.amount);
                    tracing::debug!(
                        tracked,
                        unmuted,
                        still_muted = self.store.len(),
                        "apprehension decay tick"
                    );
                    next = self.next_deadline(next);
                }
            }
        }
    }

    /// The first period boundary after `previous` that is still in the future.
    fn next_deadline(&self, previous: Instant) -> Instant {
        let now = self.clock.now();
        let mut next = previous + self.period;
        while next <= now {
            tracing::debug!("apprehension decay tick skipped after overrun");
            next += self.period;
        }
        next
    }
}
