use anyhow::Result;
use async_trait::async_trait;
use hal_channels::{ChannelId, MessageId};

/// Outbound side effects, supplied by the orchestrator.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(&self, channel_id: &ChannelId, text: &str) -> Result<()>;

    async fn react(&self, _channel_id: &ChannelId, _message_id: &MessageId, _emoji: &str) -> Result<()> {
        Ok(())
    }
}

/// Produces the text of an ambient reply.
pub trait ReplySource: Send + Sync {
    fn compose(&self, channel_id: &ChannelId) -> String;
}

impl<F> ReplySource for F
where
    F: Fn(&ChannelId) -> String + Send + Sync,
{
    fn compose(&self, channel_id: &ChannelId) -> String {
        self(channel_id)
    }
}
