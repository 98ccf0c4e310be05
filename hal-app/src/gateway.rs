//! Event dispatch: every adapter event funnels through one inbound queue and
//! is handed to the engagement engine in arrival order.

use crate::config::SocialConfig;
use crate::dialogue::GREETING;
use anyhow::Result;
use dashmap::DashMap;
use hal_channels::{ChannelId, ChannelInfo, GuildId, InboundEvent, InboundMessage, InboundReaction, UserId};
use hal_engine::{ActivityEvent, Dice, EngagementEngine, ReactionEvent, SecondsRange, Speaker};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    social: SocialConfig,
    engine: Arc<EngagementEngine>,
    speaker: Arc<dyn Speaker>,
    dice: Arc<dyn Dice>,
    guilds: DashMap<GuildId, Vec<ChannelId>>,
    last_author: DashMap<ChannelId, UserId>,
    /// Newcomers who have not spoken yet, keyed to the end of their hello window.
    newcomers: DashMap<(GuildId, UserId), Instant>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>,
}

impl Gateway {
    pub fn new(
        social: SocialConfig,
        engine: Arc<EngagementEngine>,
        speaker: Arc<dyn Speaker>,
        dice: Arc<dyn Dice>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            social,
            engine,
            speaker,
            dice,
            guilds: DashMap::new(),
            last_author: DashMap::new(),
            newcomers: DashMap::new(),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway loop received shutdown signal");
                    return Ok(());
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!("adapter closed the inbound queue");
                return Ok(());
            };
            self.handle_event(event, &shutdown);
        }
    }

    pub fn handle_event(&self, event: InboundEvent, shutdown: &CancellationToken) {
        match event {
            InboundEvent::Ready { self_id, self_name } => {
                tracing::info!(self_id = %self_id, self_name = %self_name, "transport ready");
                self.engine.mark_ready(self_id);
            }
            InboundEvent::GuildAvailable {
                guild_id,
                name,
                channels,
                joined,
            } => {
                let greeting_channel = if joined && self.social.greet_on_guild_join {
                    find_channel_by_keyword(&channels, &self.social.greeting_channel_keyword)
                } else {
                    None
                };
                let intro_channel = if joined && self.social.introduce_on_guild_join {
                    find_channel_by_keyword(&channels, &self.social.intro_channel_keyword)
                } else {
                    None
                };
                let text_channels: Vec<ChannelId> = channels
                    .into_iter()
                    .filter(|c| c.is_text)
                    .map(|c| c.id)
                    .collect();
                tracing::info!(
                    guild_id = %guild_id,
                    guild_name = %name,
                    channels = text_channels.len(),
                    joined,
                    "guild available"
                );
                self.guilds.insert(guild_id, text_channels);
                if let Some(channel_id) = greeting_channel {
                    self.say_after_pause(
                        channel_id,
                        GREETING.to_string(),
                        self.social.greeting_pause_secs,
                        shutdown.child_token(),
                    );
                }
                if let Some(channel_id) = intro_channel {
                    self.say_after_pause(
                        channel_id,
                        self.social.intro_text.clone(),
                        self.social.intro_pause_secs,
                        shutdown.child_token(),
                    );
                }
            }
            InboundEvent::GuildRemoved { guild_id } => {
                self.newcomers.retain(|(g, _), _| *g != guild_id);
                let Some((_, channels)) = self.guilds.remove(&guild_id) else {
                    tracing::debug!(guild_id = %guild_id, "removal for an unknown guild");
                    return;
                };
                for channel_id in &channels {
                    self.last_author.remove(channel_id);
                }
                self.engine.on_guild_removed(&channels);
            }
            InboundEvent::ChannelCreated { guild_id, channel } => {
                if !channel.is_text {
                    return;
                }
                tracing::debug!(guild_id = %guild_id, channel_id = %channel.id, "channel created");
                let mut channels = self.guilds.entry(guild_id).or_default();
                if !channels.contains(&channel.id) {
                    channels.push(channel.id);
                }
            }
            InboundEvent::ChannelRemoved {
                guild_id,
                channel_id,
            } => {
                if let Some(mut channels) = self.guilds.get_mut(&guild_id) {
                    channels.retain(|c| *c != channel_id);
                }
                self.last_author.remove(&channel_id);
                self.engine.on_guild_removed(std::slice::from_ref(&channel_id));
            }
            InboundEvent::MemberJoined {
                guild_id,
                user_id,
                is_bot,
            } => {
                if is_bot || !self.social.greet_new_members {
                    return;
                }
                let now = Instant::now();
                self.newcomers.retain(|_, until| *until > now);
                tracing::debug!(guild_id = %guild_id, user_id = %user_id, "newcomer joined");
                self.newcomers
                    .insert((guild_id, user_id), now + self.social.new_member_window());
            }
            InboundEvent::Message(message) => self.handle_message(message, shutdown),
            InboundEvent::Typing {
                channel_id,
                user_id,
            } => {
                self.engine.on_typing(&channel_id, &user_id);
            }
            InboundEvent::Reaction(reaction) => self.handle_reaction(reaction),
        }
    }

    fn handle_message(&self, message: InboundMessage, shutdown: &CancellationToken) {
        let referenced = self.is_referenced(&message);
        self.last_author
            .insert(message.channel_id.clone(), message.author_id.clone());

        let from_self = self.engine.self_id() == Some(&message.author_id);
        if message.author_is_bot && !from_self {
            tracing::debug!(
                channel_id = %message.channel_id,
                author_id = %message.author_id,
                "ignoring message from another bot"
            );
            return;
        }

        if let Some(guild_id) = &message.guild_id {
            self.welcome_newcomer(guild_id, &message.author_id, &message.channel_id, shutdown);
        }

        let verdict = self.engine.on_activity(&ActivityEvent {
            channel_id: message.channel_id.clone(),
            author_id: message.author_id,
            message_id: Some(message.message_id),
            text: message.content,
            referenced,
        });
        tracing::debug!(channel_id = %message.channel_id, ?verdict, "message handled");
    }

    fn handle_reaction(&self, reaction: InboundReaction) {
        let target_is_self = match (self.engine.self_id(), &reaction.message_author_id) {
            (Some(self_id), Some(author)) => self_id == author,
            _ => false,
        };
        let verdict = self.engine.on_reaction_added(&ReactionEvent {
            channel_id: reaction.channel_id.clone(),
            message_id: reaction.message_id,
            user_id: reaction.user_id,
            emoji: reaction.emoji,
            target_is_self,
        });
        tracing::debug!(channel_id = %reaction.channel_id, ?verdict, "reaction handled");
    }

    /// Mentioned, replied to, or answering right after the agent spoke.
    fn is_referenced(&self, message: &InboundMessage) -> bool {
        let Some(self_id) = self.engine.self_id() else {
            return false;
        };
        message.mentions_user(self_id)
            || message.reply_to_author.as_ref() == Some(self_id)
            || self
                .last_author
                .get(&message.channel_id)
                .is_some_and(|author| *author == *self_id)
    }

    /// Says hello the first time a newcomer speaks inside their window.
    fn welcome_newcomer(
        &self,
        guild_id: &GuildId,
        author_id: &UserId,
        channel_id: &ChannelId,
        shutdown: &CancellationToken,
    ) {
        let key = (guild_id.clone(), author_id.clone());
        let Some((_, until)) = self.newcomers.remove(&key) else {
            return;
        };
        if Instant::now() > until {
            tracing::debug!(guild_id = %guild_id, user_id = %author_id, "newcomer window expired");
            return;
        }
        self.say_after_pause(
            channel_id.clone(),
            GREETING.to_string(),
            self.social.greeting_pause_secs,
            shutdown.child_token(),
        );
    }

    fn say_after_pause(
        &self,
        channel_id: ChannelId,
        text: String,
        pause: SecondsRange,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let speaker = self.speaker.clone();
        let pause = self.dice.uniform_secs(pause);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }
            if engine.is_muted(&channel_id) {
                tracing::debug!(channel_id = %channel_id, "staying quiet in muted channel");
                return;
            }
            if let Err(e) = speaker.speak(&channel_id, &text).await {
                tracing::warn!(channel_id = %channel_id, error = %e, "social message failed");
            }
        })
    }
}

fn find_channel_by_keyword(channels: &[ChannelInfo], keyword: &str) -> Option<ChannelId> {
    let keyword = keyword.to_lowercase();
    channels
        .iter()
        .find(|c| c.is_text && c.name.to_lowercase().contains(&keyword))
        .map(|c| c.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::ChannelVoice;
    use crate::voice::tests::{Call, RecordingAdapter};
    use hal_channels::MessageId;
    use hal_engine::{EngineConfig, FixedDice, TokioClock};
    use std::time::Duration;

    const AGENT: &str = "agent";

    struct Harness {
        gateway: Gateway,
        engine: Arc<EngagementEngine>,
        adapter: Arc<RecordingAdapter>,
        shutdown: CancellationToken,
    }

    fn harness(wait: Duration) -> Harness {
        let adapter = Arc::new(RecordingAdapter::default());
        let dice: Arc<dyn Dice> = Arc::new(FixedDice::new(wait, 0.99));
        let voice: Arc<dyn Speaker> = Arc::new(ChannelVoice::new(adapter.clone(), dice.clone()));
        let engine = Arc::new(
            EngagementEngine::with_runtime(
                EngineConfig::default(),
                voice.clone(),
                Arc::new(|_: &ChannelId| "Hmm.".to_string()),
                Arc::new(TokioClock),
                dice.clone(),
            )
            .expect("engine"),
        );
        let (_tx, rx) = mpsc::channel(8);
        let gateway = Gateway::new(SocialConfig::default(), engine.clone(), voice, dice, rx);
        Harness {
            gateway,
            engine,
            adapter,
            shutdown: CancellationToken::new(),
        }
    }

    impl Harness {
        fn send(&self, event: InboundEvent) {
            self.gateway.handle_event(event, &self.shutdown);
        }

        fn ready(&self) {
            self.send(InboundEvent::Ready {
                self_id: UserId::new(AGENT),
                self_name: "Lil Hal Jr.".to_string(),
            });
        }
    }

    fn message(channel: &str, author: &str, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: MessageId::new(format!("m-{author}")),
            channel_id: ChannelId::new(channel),
            guild_id: Some(GuildId::new("g1")),
            author_id: UserId::new(author),
            author_is_bot: author == AGENT,
            content: content.to_string(),
            mentions: Vec::new(),
            reply_to_author: None,
            received_at: chrono::Utc::now(),
        }
    }

    fn guild(joined: bool) -> InboundEvent {
        InboundEvent::GuildAvailable {
            guild_id: GuildId::new("g1"),
            name: "Test Guild".to_string(),
            channels: vec![
                ChannelInfo {
                    id: ChannelId::new("voice"),
                    name: "General Voice".to_string(),
                    is_text: false,
                },
                ChannelInfo {
                    id: ChannelId::new("c1"),
                    name: "general-chat".to_string(),
                    is_text: true,
                },
                ChannelInfo {
                    id: ChannelId::new("c2"),
                    name: "memes".to_string(),
                    is_text: true,
                },
            ],
            joined,
        }
    }

    #[tokio::test]
    async fn ready_opens_the_engine() {
        let h = harness(Duration::from_secs(1));
        assert!(!h.engine.ready_gate().is_open());
        h.ready();
        assert!(h.engine.ready_gate().is_open());
        assert_eq!(h.engine.self_id(), Some(&UserId::new(AGENT)));
    }

    #[tokio::test(start_paused = true)]
    async fn mention_reply_and_follow_up_count_as_referenced() {
        let h = harness(Duration::from_secs(1));
        h.ready();

        let mut mentioned = message("c1", "u1", "what do you reckon");
        mentioned.mentions = vec![UserId::new(AGENT)];
        assert!(h.gateway.is_referenced(&mentioned));

        let mut reply = message("c1", "u1", "what do you reckon");
        reply.reply_to_author = Some(UserId::new(AGENT));
        assert!(h.gateway.is_referenced(&reply));

        let plain = message("c1", "u1", "what do you reckon");
        assert!(!h.gateway.is_referenced(&plain));
        h.send(InboundEvent::Message(message("c1", AGENT, "Hmm.")));
        assert!(h.gateway.is_referenced(&plain));
    }

    #[tokio::test(start_paused = true)]
    async fn messages_flow_through_to_a_paced_reply() {
        let h = harness(Duration::from_secs(2));
        h.ready();
        h.send(InboundEvent::Message(message("c1", "u1", "nice weather we are having")));
        assert!(h.engine.scheduler().is_waiting(&ChannelId::new("c1")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            h.adapter.calls(),
            vec![
                Call::Typing("c1".to_string()),
                Call::Send("c1".to_string(), "Hmm.".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn other_bots_are_ignored() {
        let h = harness(Duration::from_secs(2));
        h.ready();
        let mut bot = message("c1", "other-bot", "beep boop beep boop");
        bot.author_is_bot = true;
        h.send(InboundEvent::Message(bot));
        assert!(!h.engine.scheduler().is_waiting(&ChannelId::new("c1")));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_from_others_extends_the_wait() {
        let h = harness(Duration::from_secs(5));
        h.ready();
        h.send(InboundEvent::Message(message("c1", "u1", "nice weather we are having")));
        let first = h
            .engine
            .scheduler()
            .pending(&ChannelId::new("c1"))
            .expect("waiting")
            .deadline;
        tokio::time::advance(Duration::from_secs(2)).await;
        h.send(InboundEvent::Typing {
            channel_id: ChannelId::new("c1"),
            user_id: UserId::new("u2"),
        });
        let second = h
            .engine
            .scheduler()
            .pending(&ChannelId::new("c1"))
            .expect("still waiting")
            .deadline;
        assert_eq!(second - first, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_reaction_on_own_message_mutes() {
        let h = harness(Duration::from_secs(5));
        h.ready();
        h.send(InboundEvent::Reaction(InboundReaction {
            channel_id: ChannelId::new("c1"),
            message_id: MessageId::new("m-agent"),
            user_id: UserId::new("u1"),
            message_author_id: Some(UserId::new(AGENT)),
            emoji: "\u{1f92b}".to_string(),
        }));
        assert_eq!(h.engine.apprehension().level(&ChannelId::new("c1")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn joining_a_guild_greets_the_general_channel() {
        let h = harness(Duration::from_secs(3));
        h.ready();
        h.send(guild(true));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            h.adapter.calls(),
            vec![
                Call::Typing("c1".to_string()),
                Call::Send("c1".to_string(), GREETING.to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn startup_guilds_and_muted_channels_get_no_greeting() {
        let h = harness(Duration::from_secs(3));
        h.ready();
        h.send(guild(false));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.adapter.calls().is_empty());

        h.engine.apprehension().record_match(&ChannelId::new("c1"), 1);
        h.send(guild(true));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.adapter.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn guild_removal_releases_its_channels() {
        let h = harness(Duration::from_secs(5));
        h.ready();
        h.send(guild(false));
        h.engine.apprehension().record_match(&ChannelId::new("c2"), 2);
        h.send(InboundEvent::Message(message("c1", "u1", "nice weather we are having")));

        h.send(InboundEvent::GuildRemoved {
            guild_id: GuildId::new("g1"),
        });
        assert!(!h.engine.is_muted(&ChannelId::new("c2")));
        assert!(!h.engine.scheduler().is_waiting(&ChannelId::new("c1")));
        assert!(h.gateway.guilds.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn joining_a_guild_posts_the_introduction() {
        let h = harness(Duration::from_secs(3));
        h.ready();
        let InboundEvent::GuildAvailable { mut channels, .. } = guild(true) else {
            panic!("guild event");
        };
        channels.push(ChannelInfo {
            id: ChannelId::new("c3"),
            name: "Introductions".to_string(),
            is_text: true,
        });
        h.send(InboundEvent::GuildAvailable {
            guild_id: GuildId::new("g1"),
            name: "Test Guild".to_string(),
            channels,
            joined: true,
        });
        tokio::time::sleep(Duration::from_secs(30)).await;

        let calls = h.adapter.calls();
        assert!(calls.contains(&Call::Send("c1".to_string(), GREETING.to_string())));
        assert!(calls.contains(&Call::Send(
            "c3".to_string(),
            SocialConfig::default().intro_text
        )));
        assert_eq!(calls.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn newcomer_gets_a_hello_on_their_first_message_only() {
        let h = harness(Duration::from_secs(3));
        h.ready();
        h.send(guild(false));
        h.send(InboundEvent::MemberJoined {
            guild_id: GuildId::new("g1"),
            user_id: UserId::new("new"),
            is_bot: false,
        });
        tokio::time::advance(Duration::from_secs(600)).await;

        h.send(InboundEvent::Message(message("c2", "new", "hi")));
        h.send(InboundEvent::Message(message("c2", "new", "hi again")));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            h.adapter.calls(),
            vec![
                Call::Typing("c2".to_string()),
                Call::Send("c2".to_string(), GREETING.to_string()),
            ]
        );
        assert!(h.gateway.newcomers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newcomer_silent_past_the_window_gets_nothing() {
        let h = harness(Duration::from_secs(3));
        h.ready();
        h.send(InboundEvent::MemberJoined {
            guild_id: GuildId::new("g1"),
            user_id: UserId::new("new"),
            is_bot: false,
        });
        h.send(InboundEvent::MemberJoined {
            guild_id: GuildId::new("g1"),
            user_id: UserId::new("robot"),
            is_bot: true,
        });
        assert_eq!(h.gateway.newcomers.len(), 1);
        tokio::time::advance(Duration::from_secs(3601)).await;

        h.send(InboundEvent::Message(message("c2", "new", "hi")));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.adapter.calls().is_empty());
        assert!(h.gateway.newcomers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn channels_created_later_are_released_with_their_guild() {
        let h = harness(Duration::from_secs(5));
        h.ready();
        h.send(guild(false));
        h.send(InboundEvent::ChannelCreated {
            guild_id: GuildId::new("g1"),
            channel: ChannelInfo {
                id: ChannelId::new("late"),
                name: "late-night".to_string(),
                is_text: true,
            },
        });
        h.send(InboundEvent::Message(message("late", "u1", "anyone still up tonight")));
        h.engine.apprehension().record_match(&ChannelId::new("late"), 1);
        h.send(InboundEvent::Message(message("late", "u1", "anyone still up tonight")));
        assert!(h.engine.is_muted(&ChannelId::new("late")));

        h.send(InboundEvent::GuildRemoved {
            guild_id: GuildId::new("g1"),
        });
        assert!(!h.engine.is_muted(&ChannelId::new("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_channel_drops_its_pending_wait() {
        let h = harness(Duration::from_secs(5));
        h.ready();
        h.send(guild(false));
        h.send(InboundEvent::Message(message("c2", "u1", "nice weather we are having")));
        assert!(h.engine.scheduler().is_waiting(&ChannelId::new("c2")));

        h.send(InboundEvent::ChannelRemoved {
            guild_id: GuildId::new("g1"),
            channel_id: ChannelId::new("c2"),
        });
        assert!(!h.engine.scheduler().is_waiting(&ChannelId::new("c2")));
        let channels = h.gateway.guilds.get(&GuildId::new("g1")).expect("guild");
        assert_eq!(*channels, vec![ChannelId::new("c1")]);
        drop(channels);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.adapter.calls().is_empty());
    }

    #[test]
    fn greeting_channel_match_is_case_insensitive_and_text_only() {
        let InboundEvent::GuildAvailable { channels, .. } = guild(true) else {
            panic!("guild event");
        };
        assert_eq!(
            find_channel_by_keyword(&channels, "GENERAL"),
            Some(ChannelId::new("c1"))
        );
        assert_eq!(find_channel_by_keyword(&channels, "intro"), None);
    }

    #[tokio::test]
    async fn loop_exits_on_shutdown() {
        let h = harness(Duration::from_secs(1));
        let gateway = Arc::new(h.gateway);
        let handle = gateway.start(h.shutdown.clone());
        h.shutdown.cancel();
        handle.await.expect("gateway joins");
    }
}
