//! Chat platform adapters for Lil Hal.
//!
//! Adapters are pure I/O: they convert platform gateway payloads into
//! `InboundEvent`s and carry `OutboundMessage`s, typing indicators and
//! reactions back out.

mod discord;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use traits::ChatAdapter;
pub use types::{
    ChannelId, ChannelInfo, GuildId, InboundEvent, InboundMessage, InboundReaction, MessageId,
    OutboundMessage, UserId,
};
