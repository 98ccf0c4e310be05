use crate::types::{ChannelId, InboundEvent, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    /// Unique platform identifier: "discord".
    fn platform(&self) -> &str;

    /// Start receiving events. Push to tx for each inbound event.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Send a message to a channel on this platform.
    async fn send(&self, channel_id: &ChannelId, message: OutboundMessage) -> Result<()>;

    /// Show the typing indicator where supported.
    async fn send_typing(&self, _channel_id: &ChannelId) -> Result<()> {
        Ok(())
    }

    async fn add_reaction(
        &self,
        _channel_id: &ChannelId,
        _message_id: &MessageId,
        _emoji: &str,
    ) -> Result<()> {
        Err(anyhow::anyhow!(
            "add_reaction is not supported by this platform"
        ))
    }
}
