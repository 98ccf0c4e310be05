//! Debounced speaking.
//!
//! Each channel is either idle or waiting on exactly one pending session. A
//! qualifying message installs a session with a deadline drawn from the
//! addressed or ambient range; any later activity replaces it with a fresh
//! draw of the same kind. The reply is only sent once a deadline passes with
//! no newer session installed, so a busy channel keeps pushing the reply out.
//!
//! Replacement is atomic on the session map: the installed generation is the
//! only one allowed to fire, and a superseded timer that wakes late finds a
//! different generation and exits without speaking.

use crate::apprehension::ApprehensionStore;
use crate::clock::{Clock, Dice, TimerOutcome, wait_or_cancel};
use crate::config::SecondsRange;
use crate::speaker::{ReplySource, Speaker};
use dashmap::DashMap;
use hal_channels::ChannelId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Spoke,
    /// A newer session for the same channel took over.
    Superseded,
    Cancelled,
    /// The deadline passed but the channel had been muted meanwhile.
    Muted,
    SpeakFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingView {
    pub deadline: Instant,
    pub referenced: bool,
}

#[derive(Debug)]
struct PendingSession {
    generation: u64,
    referenced: bool,
    deadline: Instant,
    cancel: CancellationToken,
}

struct SchedulerInner {
    sessions: DashMap<ChannelId, PendingSession>,
    next_generation: AtomicU64,
    addressed_wait: SecondsRange,
    ambient_wait: SecondsRange,
    clock: Arc<dyn Clock>,
    dice: Arc<dyn Dice>,
    apprehension: Arc<ApprehensionStore>,
    speaker: Arc<dyn Speaker>,
    replies: Arc<dyn ReplySource>,
}

#[derive(Clone)]
pub struct EngagementScheduler {
    inner: Arc<SchedulerInner>,
}

pub struct SchedulerParts {
    pub addressed_wait: SecondsRange,
    pub ambient_wait: SecondsRange,
    pub clock: Arc<dyn Clock>,
    pub dice: Arc<dyn Dice>,
    pub apprehension: Arc<ApprehensionStore>,
    pub speaker: Arc<dyn Speaker>,
    pub replies: Arc<dyn ReplySource>,
}

impl EngagementScheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                sessions: DashMap::new(),
                next_generation: AtomicU64::new(0),
                addressed_wait: parts.addressed_wait,
                ambient_wait: parts.ambient_wait,
                clock: parts.clock,
                dice: parts.dice,
                apprehension: parts.apprehension,
                speaker: parts.speaker,
                replies: parts.replies,
            }),
        }
    }

    /// Starts (or restarts) the channel's wait. The handle reports how the
    /// session ended; callers are free to drop it.
    pub fn begin(&self, channel_id: &ChannelId, referenced: bool) -> JoinHandle<SessionOutcome> {
        let session = self.inner.draw_session(referenced);
        let (generation, deadline, token) = (session.generation, session.deadline, session.cancel.clone());
        if let Some(previous) = self.inner.sessions.insert(channel_id.clone(), session) {
            previous.cancel.cancel();
        }
        self.spawn_timer(channel_id, referenced, generation, deadline, token)
    }

    /// Restarts a running wait with a fresh draw of the same kind. Idle
    /// channels stay idle.
    ///
    /// The replacement happens under the map guard, so a timer that claims
    /// the session first leaves nothing here to extend.
    pub fn extend(&self, channel_id: &ChannelId) -> Option<JoinHandle<SessionOutcome>> {
        let mut current = self.inner.sessions.get_mut(channel_id)?;
        let referenced = current.referenced;
        let session = self.inner.draw_session(referenced);
        let (generation, deadline, token) = (session.generation, session.deadline, session.cancel.clone());
        let previous = std::mem::replace(&mut *current, session);
        drop(current);
        previous.cancel.cancel();
        Some(self.spawn_timer(channel_id, referenced, generation, deadline, token))
    }

    pub fn cancel(&self, channel_id: &ChannelId) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(channel_id) else {
            return false;
        };
        session.cancel.cancel();
        tracing::debug!(
            channel_id = %channel_id,
            generation = session.generation,
            "engagement wait cancelled"
        );
        true
    }

    pub fn cancel_many(&self, channel_ids: &[ChannelId]) -> usize {
        channel_ids
            .iter()
            .filter(|channel_id| self.cancel(channel_id))
            .count()
    }

    pub fn cancel_all(&self) -> usize {
        let channel_ids: Vec<ChannelId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.cancel_many(&channel_ids)
    }

    pub fn is_waiting(&self, channel_id: &ChannelId) -> bool {
        self.inner.sessions.contains_key(channel_id)
    }

    pub fn pending(&self, channel_id: &ChannelId) -> Option<PendingView> {
        self.inner.sessions.get(channel_id).map(|s| PendingView {
            deadline: s.deadline,
            referenced: s.referenced,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn spawn_timer(
        &self,
        channel_id: &ChannelId,
        referenced: bool,
        generation: u64,
        deadline: Instant,
        token: CancellationToken,
    ) -> JoinHandle<SessionOutcome> {
        let inner = self.inner.clone();
        tracing::debug!(
            channel_id = %channel_id,
            generation,
            referenced,
            wait_ms = deadline.saturating_duration_since(inner.clock.now()).as_millis() as u64,
            "engagement wait installed"
        );

        let channel_id = channel_id.clone();
        tokio::spawn(async move {
            let outcome = match wait_or_cancel(&*inner.clock, deadline, &token).await {
                TimerOutcome::Cancelled => inner.cancelled_outcome(&channel_id, generation),
                TimerOutcome::Elapsed => {
                    let claimed = inner
                        .sessions
                        .remove_if(&channel_id, |_, s| s.generation == generation)
                        .is_some();
                    if claimed {
                        inner.fire(&channel_id).await
                    } else {
                        SessionOutcome::Superseded
                    }
                }
            };
            tracing::debug!(channel_id = %channel_id, generation, ?outcome, "engagement wait resolved");
            outcome
        })
    }
}

impl SchedulerInner {
    fn draw_session(&self, referenced: bool) -> PendingSession {
        let range = if referenced {
            self.addressed_wait
        } else {
            self.ambient_wait
        };
        let wait = self.dice.uniform_secs(range);
        PendingSession {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed) + 1,
            referenced,
            deadline: self.clock.now() + wait,
            cancel: CancellationToken::new(),
        }
    }

    fn cancelled_outcome(&self, channel_id: &ChannelId, generation: u64) -> SessionOutcome {
        match self.sessions.get(channel_id) {
            Some(current) if current.generation != generation => SessionOutcome::Superseded,
            _ => SessionOutcome::Cancelled,
        }
    }

    async fn fire(&self, channel_id: &ChannelId) -> SessionOutcome {
        if self.apprehension.is_muted(channel_id) {
            return SessionOutcome::Muted;
        }
        let text = self.replies.compose(channel_id);
        match self.speaker.speak(channel_id, &text).await {
            Ok(()) => SessionOutcome::Spoke,
            Err(e) => {
                tracing::warn!(channel_id = %channel_id, error = %e, "speak failed");
                SessionOutcome::SpeakFailed
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{FixedDice, TokioClock};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct RecordingSpeaker {
        pub(crate) spoken: Mutex<Vec<(ChannelId, String, Instant)>>,
        pub(crate) reactions: Mutex<Vec<(ChannelId, String, String)>>,
        pub(crate) fail: bool,
    }

    impl RecordingSpeaker {
        pub(crate) fn spoken(&self) -> Vec<(ChannelId, String, Instant)> {
            self.spoken.lock().expect("spoken lock").clone()
        }

        pub(crate) fn reactions(&self) -> Vec<(ChannelId, String, String)> {
            self.reactions.lock().expect("reactions lock").clone()
        }
    }

    #[async_trait]
    impl Speaker for RecordingSpeaker {
        async fn speak(&self, channel_id: &ChannelId, text: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow::anyhow!("missing permissions"));
            }
            self.spoken.lock().expect("spoken lock").push((
                channel_id.clone(),
                text.to_string(),
                Instant::now(),
            ));
            Ok(())
        }

        async fn react(
            &self,
            channel_id: &ChannelId,
            message_id: &hal_channels::MessageId,
            emoji: &str,
        ) -> Result<()> {
            self.reactions.lock().expect("reactions lock").push((
                channel_id.clone(),
                message_id.to_string(),
                emoji.to_string(),
            ));
            Ok(())
        }
    }

    struct Harness {
        scheduler: EngagementScheduler,
        speaker: Arc<RecordingSpeaker>,
        apprehension: Arc<ApprehensionStore>,
    }

    fn harness(wait: Duration, speaker: RecordingSpeaker) -> Harness {
        let speaker = Arc::new(speaker);
        let apprehension = Arc::new(ApprehensionStore::new(1));
        let scheduler = EngagementScheduler::new(SchedulerParts {
            addressed_wait: SecondsRange(1, 4),
            ambient_wait: SecondsRange(5, 12),
            clock: Arc::new(TokioClock),
            dice: Arc::new(FixedDice::new(wait, 0.5)),
            apprehension: apprehension.clone(),
            speaker: speaker.clone(),
            replies: Arc::new(|_: &ChannelId| "Hmm.".to_string()),
        });
        Harness {
            scheduler,
            speaker,
            apprehension,
        }
    }

    fn c1() -> ChannelId {
        ChannelId::new("c1")
    }

    #[tokio::test(start_paused = true)]
    async fn new_activity_pushes_the_reply_past_the_first_deadline() {
        let h = harness(Duration::from_secs(8), RecordingSpeaker::default());
        let start = Instant::now();

        let first = h.scheduler.begin(&c1(), false);
        tokio::time::advance(Duration::from_secs(3)).await;
        let second = h.scheduler.begin(&c1(), false);

        assert_eq!(first.await.expect("first joins"), SessionOutcome::Superseded);
        assert_eq!(second.await.expect("second joins"), SessionOutcome::Spoke);

        let spoken = h.speaker.spoken();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].0, c1());
        assert_eq!(spoken[0].1, "Hmm.");
        assert_eq!(spoken[0].2 - start, Duration::from_secs(11));
        assert!(!h.scheduler.is_waiting(&c1()));
    }

    #[tokio::test(start_paused = true)]
    async fn muting_during_the_wait_suppresses_the_reply() {
        let h = harness(Duration::from_secs(2), RecordingSpeaker::default());
        let pending = h.scheduler.begin(&c1(), true);
        tokio::time::advance(Duration::from_secs(1)).await;
        h.apprehension.record_match(&c1(), 1);

        assert_eq!(pending.await.expect("joins"), SessionOutcome::Muted);
        assert!(h.speaker.spoken().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_pending_reply() {
        let h = harness(Duration::from_secs(2), RecordingSpeaker::default());
        let pending = h.scheduler.begin(&c1(), true);
        assert!(h.scheduler.is_waiting(&c1()));
        assert!(h.scheduler.cancel(&c1()));
        assert!(!h.scheduler.cancel(&c1()));

        assert_eq!(pending.await.expect("joins"), SessionOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.speaker.spoken().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_restarts_with_the_same_kind() {
        let h = harness(Duration::from_secs(8), RecordingSpeaker::default());
        let start = Instant::now();
        assert!(h.scheduler.extend(&c1()).is_none(), "idle channels stay idle");

        let first = h.scheduler.begin(&c1(), true);
        tokio::time::advance(Duration::from_secs(5)).await;
        let extended = h.scheduler.extend(&c1()).expect("waiting channel extends");
        let view = h.scheduler.pending(&c1()).expect("still pending");
        assert!(view.referenced);
        assert_eq!(view.deadline - start, Duration::from_secs(13));

        assert_eq!(first.await.expect("joins"), SessionOutcome::Superseded);
        assert_eq!(extended.await.expect("joins"), SessionOutcome::Spoke);
        assert_eq!(h.speaker.spoken()[0].2 - start, Duration::from_secs(13));
    }

    /// Keeps every reply in flight for thirty seconds.
    #[derive(Default)]
    struct SlowSpeaker {
        started: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Speaker for SlowSpeaker {
        async fn speak(&self, _channel_id: &ChannelId, _text: &str) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extend_after_the_timer_claims_leaves_the_channel_idle() {
        let speaker = Arc::new(SlowSpeaker::default());
        let scheduler = EngagementScheduler::new(SchedulerParts {
            addressed_wait: SecondsRange(1, 4),
            ambient_wait: SecondsRange(5, 12),
            clock: Arc::new(TokioClock),
            dice: Arc::new(FixedDice::new(Duration::from_secs(8), 0.5)),
            apprehension: Arc::new(ApprehensionStore::new(1)),
            speaker: speaker.clone(),
            replies: Arc::new(|_: &ChannelId| "Hmm.".to_string()),
        });

        let first = scheduler.begin(&c1(), false);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(speaker.started.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_waiting(&c1()));

        assert!(scheduler.extend(&c1()).is_none());
        assert!(!scheduler.is_waiting(&c1()));

        assert_eq!(first.await.expect("join"), SessionOutcome::Spoke);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(speaker.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_activity_yields_one_reply_after_the_last_event() {
        let h = harness(Duration::from_secs(5), RecordingSpeaker::default());
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            handles.push(h.scheduler.begin(&c1(), false));
            tokio::time::advance(Duration::from_secs(4)).await;
        }
        // Last activity at t=20, so the reply lands at t=25.
        let outcomes: Vec<SessionOutcome> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.expect("joins"))
            .collect();
        assert_eq!(
            outcomes.iter().filter(|o| **o == SessionOutcome::Spoke).count(),
            1
        );
        assert_eq!(outcomes.last(), Some(&SessionOutcome::Spoke));
        let spoken = h.speaker.spoken();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].2 - start, Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn channels_wait_independently() {
        let h = harness(Duration::from_secs(3), RecordingSpeaker::default());
        let a = h.scheduler.begin(&ChannelId::new("a"), false);
        let b = h.scheduler.begin(&ChannelId::new("b"), false);
        assert_eq!(h.scheduler.pending_count(), 2);
        assert_eq!(a.await.expect("joins"), SessionOutcome::Spoke);
        assert_eq!(b.await.expect("joins"), SessionOutcome::Spoke);
        assert_eq!(h.speaker.spoken().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn speak_failures_are_absorbed() {
        let h = harness(
            Duration::from_secs(1),
            RecordingSpeaker {
                fail: true,
                ..RecordingSpeaker::default()
            },
        );
        let pending = h.scheduler.begin(&c1(), true);
        assert_eq!(pending.await.expect("joins"), SessionOutcome::SpeakFailed);
        assert!(!h.scheduler.is_waiting(&c1()));

        let retry = h.scheduler.begin(&c1(), true);
        assert_eq!(retry.await.expect("joins"), SessionOutcome::SpeakFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_many_reports_only_waiting_channels() {
        let h = harness(Duration::from_secs(3), RecordingSpeaker::default());
        let _a = h.scheduler.begin(&ChannelId::new("a"), false);
        let _b = h.scheduler.begin(&ChannelId::new("b"), false);
        let cancelled = h.scheduler.cancel_many(&[
            ChannelId::new("a"),
            ChannelId::new("b"),
            ChannelId::new("idle"),
        ]);
        assert_eq!(cancelled, 2);
        assert_eq!(h.scheduler.pending_count(), 0);
    }
}
