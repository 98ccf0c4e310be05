use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(GuildId);
id_newtype!(UserId);

/// A text channel as announced by the platform when the bot joins a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub is_text: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
    #[serde(default)]
    pub author_is_bot: bool,
    pub content: String,
    /// Users explicitly mentioned by the message.
    #[serde(default)]
    pub mentions: Vec<UserId>,
    /// Author of the message this one replies to, if any.
    #[serde(default)]
    pub reply_to_author: Option<UserId>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn mentions_user(&self, user_id: &UserId) -> bool {
        self.mentions.iter().any(|m| m == user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReaction {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    /// Author of the message that received the reaction, when the platform reports it.
    #[serde(default)]
    pub message_author_id: Option<UserId>,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    Ready {
        self_id: UserId,
        #[serde(default)]
        self_name: String,
    },
    GuildAvailable {
        guild_id: GuildId,
        #[serde(default)]
        name: String,
        channels: Vec<ChannelInfo>,
        /// True when the bot was newly added, false when the guild is replayed at startup.
        #[serde(default)]
        joined: bool,
    },
    GuildRemoved {
        guild_id: GuildId,
    },
    ChannelCreated {
        guild_id: GuildId,
        channel: ChannelInfo,
    },
    ChannelRemoved {
        guild_id: GuildId,
        channel_id: ChannelId,
    },
    /// Someone joined a guild the bot is in.
    MemberJoined {
        guild_id: GuildId,
        user_id: UserId,
        #[serde(default)]
        is_bot: bool,
    },
    Message(InboundMessage),
    Typing {
        channel_id: ChannelId,
        user_id: UserId,
    },
    Reaction(InboundReaction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
        }
    }
}
