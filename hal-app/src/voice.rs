//! Paced speaking through a chat adapter.

use anyhow::Result;
use async_trait::async_trait;
use hal_channels::{ChannelId, ChatAdapter, MessageId, OutboundMessage};
use hal_engine::{Dice, SecondsRange, Speaker};
use std::sync::Arc;

pub struct ChannelVoice {
    adapter: Arc<dyn ChatAdapter>,
    dice: Arc<dyn Dice>,
}

impl ChannelVoice {
    pub fn new(adapter: Arc<dyn ChatAdapter>, dice: Arc<dyn Dice>) -> Self {
        Self { adapter, dice }
    }
}

/// Upper bound, in whole seconds, of the "typing" pause before `text` is sent.
pub fn typing_pause_ceiling(text: &str) -> u64 {
    (text.chars().count() % 80) as u64 / 4
}

#[async_trait]
impl Speaker for ChannelVoice {
    async fn speak(&self, channel_id: &ChannelId, text: &str) -> Result<()> {
        if let Err(e) = self.adapter.send_typing(channel_id).await {
            tracing::debug!(channel_id = %channel_id, error = %e, "typing indicator failed");
        }
        let pause = self
            .dice
            .uniform_secs(SecondsRange(0, typing_pause_ceiling(text)));
        tokio::time::sleep(pause).await;
        self.adapter
            .send(channel_id, OutboundMessage::text(text))
            .await?;
        tracing::info!(
            channel_id = %channel_id,
            platform = self.adapter.platform(),
            chars = text.chars().count(),
            "spoke"
        );
        Ok(())
    }

    async fn react(&self, channel_id: &ChannelId, message_id: &MessageId, emoji: &str) -> Result<()> {
        self.adapter.add_reaction(channel_id, message_id, emoji).await
    }
}
