//! Communication channels (WhatsApp Cloud API).
//!
//! Inbound webhook payloads are validated into [`InboundMessage`]s; replies go out through a
//! [`ChannelHandle`] so the gateway can be driven with a fake sender in tests.

mod handle;
mod inbound;
mod whatsapp;

pub use handle::{ChannelError, ChannelHandle};
pub use inbound::{InboundMessage, ReplyTarget};
pub use whatsapp::{
    parse_inbound, verify_signature, verify_subscription, ChangeMetadata, ChangeValue,
    InboundError, SubscriptionCheck, WebhookChange, WebhookEntry, WebhookPayload, WhatsAppChannel,
    WhatsAppMessage, WhatsAppText,
};
