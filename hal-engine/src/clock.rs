//! Time, cancellable waits and randomness.
//!
//! Everything timing-sensitive in the engine goes through [`Clock`] and
//! [`Dice`] so tests can run on tokio's paused clock with fixed draws.

use crate::config::SecondsRange;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

/// Tokio's timer wheel. Honors `tokio::time::pause` in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Elapsed,
    Cancelled,
}

/// Waits for `deadline` unless `token` is cancelled first. Cancellation wins ties.
pub async fn wait_or_cancel(
    clock: &dyn Clock,
    deadline: Instant,
    token: &CancellationToken,
) -> TimerOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => TimerOutcome::Cancelled,
        _ = clock.sleep_until(deadline) => TimerOutcome::Elapsed,
    }
}

pub trait Dice: Send + Sync {
    /// Whole seconds in `[low, high]` plus a fractional second.
    fn uniform_secs(&self, range: SecondsRange) -> Duration;

    /// Uniform in `[0, 1)`.
    fn roll(&self) -> f64;
}

fn draw_secs<R: Rng + ?Sized>(rng: &mut R, range: SecondsRange) -> Duration {
    let whole = rng.gen_range(range.low()..=range.high());
    let fraction: f64 = rng.r#gen();
    Duration::from_secs_f64(whole as f64 + fraction)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDice;

impl Dice for ThreadDice {
    fn uniform_secs(&self, range: SecondsRange) -> Duration {
        draw_secs(&mut rand::thread_rng(), range)
    }

    fn roll(&self) -> f64 {
        rand::thread_rng().r#gen()
    }
}

/// Reproducible draws from a fixed seed.
#[derive(Debug)]
pub struct SeededDice {
    rng: Mutex<StdRng>,
}

impl SeededDice {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Dice for SeededDice {
    fn uniform_secs(&self, range: SecondsRange) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        draw_secs(&mut *rng, range)
    }

    fn roll(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.r#gen()
    }
}

/// Constant waits and scripted rolls. Once the script runs out every roll
/// returns the fallback value.
#[derive(Debug)]
pub struct FixedDice {
    wait: Duration,
    fallback_roll: f64,
    scripted_rolls: Mutex<VecDeque<f64>>,
}

impl FixedDice {
    pub fn new(wait: Duration, roll: f64) -> Self {
        Self {
            wait,
            fallback_roll: roll,
            scripted_rolls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_rolls(mut self, rolls: impl IntoIterator<Item = f64>) -> Self {
        self.scripted_rolls = Mutex::new(rolls.into_iter().collect());
        self
    }
}

impl Dice for FixedDice {
    fn uniform_secs(&self, _range: SecondsRange) -> Duration {
        self.wait
    }

    fn roll(&self) -> f64 {
        self.scripted_rolls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.fallback_roll)
    }
}

/// One-shot readiness latch. Waiting on an open gate returns immediately.
#[derive(Debug, Clone)]
pub struct ReadyGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}
