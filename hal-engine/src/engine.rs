//! The orchestrator-facing facade.
//!
//! [`EngagementEngine`] owns every engine component and turns transport
//! events into store updates, waits and episodes. Each entry point is
//! synchronous and returns a verdict; the side effects it starts (timers,
//! acknowledgement reactions, join-ins) run detached.

use crate::apprehension::ApprehensionStore;
use crate::clock::{Clock, Dice, ReadyGate};
use crate::config::EngineConfig;
use crate::decay::DecayTicker;
use crate::episode::EpisodeCoordinator;
use crate::error::Result;
use crate::keywords::{KeywordMatcher, is_addressed};
use crate::scheduler::{EngagementScheduler, SchedulerParts};
use crate::speaker::{ReplySource, Speaker};
use hal_channels::{ChannelId, MessageId, UserId};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    /// Target for the acknowledgement reaction when the message mutes the agent.
    pub message_id: Option<MessageId>,
    pub text: String,
    /// Mentioned, replied to, or spoken to right after the agent spoke.
    pub referenced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEvent {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub target_is_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityVerdict {
    Ignored,
    Muted { level: i64 },
    /// An unmute phrase cleared the channel. `scheduled` reports whether the
    /// same message also started a wait.
    Unmuted { scheduled: bool },
    Suppressed,
    Scheduled { referenced: bool },
    Extended,
    TooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionVerdict {
    Ignored,
    Muted { level: i64 },
    Suppressed,
    JoinIn { fired: bool },
}

pub struct EngagementEngine {
    config: EngineConfig,
    matcher: KeywordMatcher,
    apprehension: Arc<ApprehensionStore>,
    scheduler: EngagementScheduler,
    episodes: EpisodeCoordinator,
    speaker: Arc<dyn Speaker>,
    clock: Arc<dyn Clock>,
    gate: ReadyGate,
    self_id: OnceLock<UserId>,
    shutdown: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngagementEngine {
    /// Wires the engine onto the given clock and dice. Production callers
    /// pass [`TokioClock`](crate::TokioClock) and [`EngineConfig::dice`].
    pub fn with_runtime(
        config: EngineConfig,
        speaker: Arc<dyn Speaker>,
        replies: Arc<dyn ReplySource>,
        clock: Arc<dyn Clock>,
        dice: Arc<dyn Dice>,
    ) -> Result<Self> {
        config.validate()?;
        let matcher = KeywordMatcher::new(&config.mute_phrases, &config.unmute_phrases)?;
        let apprehension = Arc::new(ApprehensionStore::new(config.severity_bonus));
        let scheduler = EngagementScheduler::new(SchedulerParts {
            addressed_wait: config.addressed_wait_secs,
            ambient_wait: config.ambient_wait_secs,
            clock: clock.clone(),
            dice: dice.clone(),
            apprehension: apprehension.clone(),
            speaker: speaker.clone(),
            replies,
        });
        let episodes = EpisodeCoordinator::new(dice, config.episode_divisor);
        tracing::debug!(
            mute_phrases = matcher.mute_phrase_count(),
            unmute_phrases = matcher.unmute_phrase_count(),
            "engagement engine initialized"
        );
        Ok(Self {
            config,
            matcher,
            apprehension,
            scheduler,
            episodes,
            speaker,
            clock,
            gate: ReadyGate::new(),
            self_id: OnceLock::new(),
            shutdown: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn apprehension(&self) -> &Arc<ApprehensionStore> {
        &self.apprehension
    }

    pub fn scheduler(&self) -> &EngagementScheduler {
        &self.scheduler
    }

    pub fn episodes(&self) -> &EpisodeCoordinator {
        &self.episodes
    }

    pub fn ready_gate(&self) -> &ReadyGate {
        &self.gate
    }

    pub fn is_muted(&self, channel_id: &ChannelId) -> bool {
        self.apprehension.is_muted(channel_id)
    }

    pub fn self_id(&self) -> Option<&UserId> {
        self.self_id.get()
    }

    /// Records the agent's identity and opens the ready gate. Later calls
    /// (gateway reconnects) keep the first identity.
    pub fn mark_ready(&self, self_id: UserId) {
        if self.self_id.set(self_id.clone()).is_err() {
            tracing::debug!(self_id = %self_id, "engine already marked ready");
        }
        self.gate.open();
    }

    fn is_self(&self, user_id: &UserId) -> bool {
        self.self_id.get().is_some_and(|id| id == user_id)
    }

    pub fn on_activity(&self, event: &ActivityEvent) -> ActivityVerdict {
        if self.is_self(&event.author_id) {
            return ActivityVerdict::Ignored;
        }
        let channel_id = &event.channel_id;

        let unmuted = self.apprehension.is_muted(channel_id)
            && self.matcher.match_unmute(&event.text)
            && self.apprehension.record_reset(channel_id);
        if unmuted {
            tracing::info!(channel_id = %channel_id, author_id = %event.author_id, "unmuted by phrase");
        }

        let addressed =
            event.referenced || is_addressed(&event.text, &self.config.address_tokens);
        if addressed || !self.config.require_address {
            if let Some(hit) = self.matcher.match_mute(&event.text) {
                let level = self.apprehension.record_match(channel_id, hit.severity);
                self.scheduler.cancel(channel_id);
                tracing::info!(
                    channel_id = %channel_id,
                    author_id = %event.author_id,
                    phrase = %hit.phrase,
                    severity = hit.severity,
                    level,
                    "muted by phrase"
                );
                if let Some(message_id) = &event.message_id {
                    self.acknowledge(channel_id, message_id);
                }
                return ActivityVerdict::Muted { level };
            }
        }

        if self.apprehension.is_muted(channel_id) {
            return ActivityVerdict::Suppressed;
        }

        let verdict = if event.text.split_whitespace().count() >= self.config.min_words {
            self.scheduler.begin(channel_id, addressed);
            ActivityVerdict::Scheduled {
                referenced: addressed,
            }
        } else if self.scheduler.extend(channel_id).is_some() {
            ActivityVerdict::Extended
        } else {
            ActivityVerdict::TooShort
        };

        if unmuted {
            return ActivityVerdict::Unmuted {
                scheduled: matches!(verdict, ActivityVerdict::Scheduled { .. }),
            };
        }
        verdict
    }

    /// Typing by anyone but the agent keeps a running wait alive.
    pub fn on_typing(&self, channel_id: &ChannelId, user_id: &UserId) -> bool {
        if self.is_self(user_id) || self.apprehension.is_muted(channel_id) {
            return false;
        }
        self.scheduler.extend(channel_id).is_some()
    }

    /// Forgets every listed channel. Returns how many were muted.
    pub fn on_guild_removed(&self, channel_ids: &[ChannelId]) -> usize {
        let evicted = self.apprehension.evict_guild(channel_ids);
        let cancelled = self.scheduler.cancel_many(channel_ids);
        tracing::info!(
            channels = channel_ids.len(),
            evicted,
            cancelled,
            "guild channels released"
        );
        evicted
    }

    pub fn on_reaction_added(&self, event: &ReactionEvent) -> ReactionVerdict {
        if self.is_self(&event.user_id) {
            return ReactionVerdict::Ignored;
        }
        let channel_id = &event.channel_id;

        if event.target_is_self && event.emoji == self.config.quiet_emoji {
            let level = self
                .apprehension
                .record_match(channel_id, self.config.reaction_mute_severity);
            self.scheduler.cancel(channel_id);
            tracing::info!(
                channel_id = %channel_id,
                user_id = %event.user_id,
                level,
                "muted by reaction"
            );
            return ReactionVerdict::Muted { level };
        }

        if event.target_is_self {
            return ReactionVerdict::Ignored;
        }
        if self.apprehension.is_muted(channel_id) {
            return ReactionVerdict::Suppressed;
        }

        let speaker = self.speaker.clone();
        let target_channel = channel_id.clone();
        let message_id = event.message_id.clone();
        let emoji = event.emoji.clone();
        let join_in = move || async move {
            if let Err(e) = speaker.react(&target_channel, &message_id, &emoji).await {
                tracing::warn!(channel_id = %target_channel, error = %e, "join-in reaction failed");
            }
        };

        let clock = self.clock.clone();
        let deadline = clock.now() + self.config.episode_window();
        let shutdown = self.shutdown.clone();
        let window = async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = clock.sleep_until(deadline) => {}
            }
        };

        let episode = self.episodes.get(channel_id, join_in, window);
        let fired = episode.call().is_some();
        ReactionVerdict::JoinIn { fired }
    }

    fn acknowledge(&self, channel_id: &ChannelId, message_id: &MessageId) {
        let speaker = self.speaker.clone();
        let channel_id = channel_id.clone();
        let message_id = message_id.clone();
        let emoji = self.config.acknowledge_emoji.clone();
        tokio::spawn(async move {
            if let Err(e) = speaker.react(&channel_id, &message_id, &emoji).await {
                tracing::warn!(channel_id = %channel_id, error = %e, "mute acknowledgement failed");
            }
        });
    }

    /// Starts the decay ticker. It idles until [`Self::mark_ready`].
    pub async fn spawn_decay(&self) {
        let ticker = DecayTicker::new(
            self.apprehension.clone(),
            self.gate.clone(),
            self.clock.clone(),
            self.config.decay_period(),
            self.config.decay_amount,
        );
        let handle = ticker.spawn(self.shutdown.child_token());
        self.background_tasks.lock().await.push(handle);
    }

    /// Cancels pending waits and background loops, then joins the loops.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.scheduler.cancel_all();
        let handles = std::mem::take(&mut *self.background_tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "engine background task ended abnormally");
            }
        }
        tracing::info!(cancelled_waits = cancelled, "engagement engine stopped");
    }
}
