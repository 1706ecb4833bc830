//! Outbound side of a channel.

use crate::channels::inbound::ReplyTarget;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel send failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel api error: {0}")]
    Api(String),
}

/// Handle to a channel that can deliver replies.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "whatsapp").
    fn id(&self) -> &str;
    /// Send a text message to the target.
    async fn send_message(&self, target: &ReplyTarget, text: &str) -> Result<(), ChannelError>;
}
