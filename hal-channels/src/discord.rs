use crate::traits::ChatAdapter;
use crate::types::{
    ChannelId, ChannelInfo, InboundEvent, InboundMessage, InboundReaction, MessageId,
    OutboundMessage, UserId,
};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
// GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | GUILD_MESSAGE_REACTIONS | GUILD_MESSAGE_TYPING
// | MESSAGE_CONTENT. GUILD_MEMBERS and MESSAGE_CONTENT are privileged and must be
// enabled for the application.
const DISCORD_DEFAULT_INTENTS: u64 =
    (1 << 0) | (1 << 1) | (1 << 9) | (1 << 10) | (1 << 11) | (1 << 15);
const DISCORD_TEXT_CHANNEL: u8 = 0;
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

fn reconnect_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6)).min(RECONNECT_BACKOFF_CAP)
}

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    gateway_intents: u64,
}

impl std::fmt::Debug for DiscordAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordAdapter")
            .field("bot_token", &"<redacted>")
            .field("gateway_intents", &self.gateway_intents)
            .finish_non_exhaustive()
    }
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            gateway_intents: DISCORD_DEFAULT_INTENTS,
        })
    }

    pub fn with_gateway_intents(mut self, gateway_intents: u64) -> Self {
        self.gateway_intents = gateway_intents;
        self
    }

    fn api_url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(DISCORD_API_BASE)?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("discord api base cannot be a base url"))?
            .extend(segments);
        Ok(url)
    }

    async fn check(resp: reqwest::Response, action: &str) -> Result<()> {
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord {action} failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChatAdapter for DiscordAdapter {
    fn platform(&self) -> &str {
        "discord"
    }

    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_gateway_loop(tx).await {
                tracing::error!(%e, "discord gateway loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, channel_id: &ChannelId, message: OutboundMessage) -> Result<()> {
        let url = self.api_url(&["channels", channel_id.as_str(), "messages"])?;
        let mut body = serde_json::json!({ "content": message.content });
        if let Some(reply_to) = message.reply_to_message_id {
            body["message_reference"] = serde_json::json!({ "message_id": reply_to });
        }
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&body)
            .send()
            .await?;
        Self::check(resp, "send").await
    }

    async fn send_typing(&self, channel_id: &ChannelId) -> Result<()> {
        let url = self.api_url(&["channels", channel_id.as_str(), "typing"])?;
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .header("Content-Length", "0")
            .send()
            .await?;
        Self::check(resp, "typing").await
    }

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<()> {
        let url = self.api_url(&[
            "channels",
            channel_id.as_str(),
            "messages",
            message_id.as_str(),
            "reactions",
            emoji,
            "@me",
        ])?;
        let resp = self
            .http
            .put(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .header("Content-Length", "0")
            .send()
            .await?;
        Self::check(resp, "add_reaction").await
    }
}

/// Guild ids announced in READY; GUILD_CREATE for any other guild is a fresh join.
#[derive(Debug, Default)]
struct GatewaySession {
    startup_guilds: HashSet<String>,
}

impl DiscordAdapter {
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let started = tokio::time::Instant::now();
            let err = match self.run_gateway_once(tx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if tx.is_closed() {
                return Err(err);
            }
            // A session that stayed up for a while resets the backoff.
            if started.elapsed() > RECONNECT_BACKOFF_CAP {
                attempt = 0;
            }
            let backoff = reconnect_backoff(attempt);
            attempt = attempt.saturating_add(1);
            tracing::warn!(
                %err,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "discord gateway disconnected; reconnecting"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn run_gateway_once(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        // HELLO.
        let heartbeat_interval_ms: u64 = if let Some(msg) = read.next().await {
            let msg = msg?;
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;
            v.get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|x| x.as_u64())
                .ok_or_else(|| anyhow::anyhow!("discord HELLO missing heartbeat_interval"))?
        } else {
            return Err(anyhow::anyhow!("discord gateway closed before HELLO"));
        };

        // IDENTIFY.
        let identify = serde_json::json!({
            "op": 2,
            "d": {
                "token": format!("Bot {}", self.bot_token),
                "intents": self.gateway_intents,
                "properties": { "os": "linux", "browser": "lilhal", "device": "lilhal" }
            }
        });
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));

        // Heartbeat loop.
        {
            let write = write.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
                loop {
                    interval.tick().await;
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        let mut session = GatewaySession::default();
        while let Some(msg) = read.next().await {
            let msg = msg?;
            let txt = msg.to_text()?;
            let v: serde_json::Value = serde_json::from_str(txt)?;

            if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                *seq.write().await = Some(s);
            }

            let op = v
                .get("op")
                .and_then(|o| o.as_i64())
                .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
            if op != 0 {
                continue;
            }

            let Some(t) = v.get("t").and_then(|t| t.as_str()) else {
                continue;
            };
            let payload = v.get("d").cloned().unwrap_or(serde_json::Value::Null);
            let event = match map_dispatch(t, payload, &mut session) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(%e, dispatch = t, "discord dispatch payload rejected");
                    continue;
                }
            };
            tx.send(event)
                .await
                .map_err(|e| anyhow::anyhow!("discord inbound queue closed: {e}"))?;
        }

        Err(anyhow::anyhow!("discord gateway stream ended unexpectedly"))
    }
}

fn map_dispatch(
    t: &str,
    payload: serde_json::Value,
    session: &mut GatewaySession,
) -> Result<Option<InboundEvent>> {
    let event = match t {
        "READY" => {
            let ready: DiscordReady = serde_json::from_value(payload)?;
            session.startup_guilds = ready.guilds.into_iter().map(|g| g.id).collect();
            InboundEvent::Ready {
                self_id: ready.user.id.into(),
                self_name: ready.user.username,
            }
        }
        "GUILD_CREATE" => {
            let guild: DiscordGuildCreate = serde_json::from_value(payload)?;
            let joined = !session.startup_guilds.remove(&guild.id);
            InboundEvent::GuildAvailable {
                guild_id: guild.id.into(),
                name: guild.name,
                channels: guild.channels.into_iter().map(channel_info).collect(),
                joined,
            }
        }
        "GUILD_DELETE" => {
            let guild: DiscordGuildDelete = serde_json::from_value(payload)?;
            // Unavailable means an outage, not a removal.
            if guild.unavailable {
                return Ok(None);
            }
            InboundEvent::GuildRemoved {
                guild_id: guild.id.into(),
            }
        }
        "CHANNEL_CREATE" | "CHANNEL_DELETE" => {
            let channel: DiscordChannel = serde_json::from_value(payload)?;
            // Direct-message channels carry no guild.
            let Some(guild_id) = channel.guild_id.clone() else {
                return Ok(None);
            };
            if t == "CHANNEL_DELETE" {
                InboundEvent::ChannelRemoved {
                    guild_id: guild_id.into(),
                    channel_id: channel.id.into(),
                }
            } else {
                InboundEvent::ChannelCreated {
                    guild_id: guild_id.into(),
                    channel: channel_info(channel),
                }
            }
        }
        "GUILD_MEMBER_ADD" => {
            let member: DiscordMemberAdd = serde_json::from_value(payload)?;
            InboundEvent::MemberJoined {
                guild_id: member.guild_id.into(),
                user_id: member.user.id.into(),
                is_bot: member.user.bot,
            }
        }
        "MESSAGE_CREATE" => {
            let message: DiscordMessageCreate = serde_json::from_value(payload)?;
            InboundEvent::Message(InboundMessage {
                message_id: message.id.into(),
                channel_id: message.channel_id.into(),
                guild_id: message.guild_id.map(Into::into),
                author_id: message.author.id.into(),
                author_is_bot: message.author.bot,
                content: message.content,
                mentions: message.mentions.into_iter().map(|m| m.id.into()).collect(),
                reply_to_author: message
                    .referenced_message
                    .map(|r| UserId::from(r.author.id)),
                received_at: Utc::now(),
            })
        }
        "TYPING_START" => {
            let typing: DiscordTypingStart = serde_json::from_value(payload)?;
            InboundEvent::Typing {
                channel_id: typing.channel_id.into(),
                user_id: typing.user_id.into(),
            }
        }
        "MESSAGE_REACTION_ADD" => {
            let reaction: DiscordReactionAdd = serde_json::from_value(payload)?;
            let Some(emoji) = reaction.emoji.name else {
                return Ok(None);
            };
            InboundEvent::Reaction(InboundReaction {
                channel_id: reaction.channel_id.into(),
                message_id: reaction.message_id.into(),
                user_id: reaction.user_id.into(),
                message_author_id: reaction.message_author_id.map(Into::into),
                emoji,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn channel_info(channel: DiscordChannel) -> ChannelInfo {
    ChannelInfo {
        id: channel.id.into(),
        name: channel.name.unwrap_or_default(),
        is_text: channel.kind == DISCORD_TEXT_CHANNEL,
    }
}

#[derive(Debug, Deserialize)]
struct DiscordReady {
    user: DiscordUser,
    #[serde(default)]
    guilds: Vec<DiscordUnavailableGuild>,
}

#[derive(Debug, Deserialize)]
struct DiscordUnavailableGuild {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordGuildCreate {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    channels: Vec<DiscordChannel>,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMemberAdd {
    guild_id: String,
    user: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordGuildDelete {
    id: String,
    #[serde(default)]
    unavailable: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    #[serde(default)]
    mentions: Vec<DiscordUser>,
    #[serde(default)]
    referenced_message: Option<DiscordReferencedMessage>,
}

#[derive(Debug, Deserialize)]
struct DiscordReferencedMessage {
    author: DiscordUser,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordTypingStart {
    channel_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordReactionAdd {
    user_id: String,
    channel_id: String,
    message_id: String,
    #[serde(default)]
    message_author_id: Option<String>,
    emoji: DiscordEmoji,
}

#[derive(Debug, Deserialize)]
struct DiscordEmoji {
    #[serde(default)]
    name: Option<String>,
}
