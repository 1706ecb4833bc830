//! Inbound message from a channel: handed to the relay workflow for one reply.

/// A text message received from a channel, with what is needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Provider message id (WhatsApp `wamid`), used to drop redeliveries.
    pub message_id: Option<String>,
    /// Sender address (WhatsApp phone number).
    pub from: String,
    pub text: String,
    /// Business number that received the message; replies are sent from it.
    pub phone_number_id: String,
}

impl InboundMessage {
    /// Where the reply to this message goes.
    pub fn reply_target(&self) -> ReplyTarget {
        ReplyTarget {
            phone_number_id: self.phone_number_id.clone(),
            to: self.from.clone(),
        }
    }
}

/// Destination of an outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub phone_number_id: String,
    pub to: String,
}
