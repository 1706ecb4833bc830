//! WhatsApp Cloud API channel: webhook verification, payload validation, and sending replies
//! through the Graph API `messages` endpoint.

use crate::channels::handle::{ChannelError, ChannelHandle};
use crate::channels::inbound::{InboundMessage, ReplyTarget};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CHANNEL_ID: &str = "whatsapp";

/// Webhook POST body. Every level is optional so that shape errors are reported by
/// [`parse_inbound`] rather than by serde.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub value: Option<ChangeValue>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<ChangeMetadata>,
    #[serde(default)]
    pub messages: Option<Vec<WhatsAppMessage>>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeMetadata {
    #[serde(default)]
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub text: Option<WhatsAppText>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppText {
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("webhook body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("webhook body is missing {0}")]
    Malformed(&'static str),
}

/// Validate a webhook body and pull out the first message
/// (`entry[0].changes[0].value.messages[0]`). Anything else in the payload is ignored.
pub fn parse_inbound(body: &[u8]) -> Result<InboundMessage, InboundError> {
    let payload: WebhookPayload = serde_json::from_slice(body)?;
    if payload.object.is_none() {
        return Err(InboundError::Malformed("object"));
    }
    let value = payload
        .entry
        .first()
        .ok_or(InboundError::Malformed("entry[0]"))?
        .changes
        .first()
        .ok_or(InboundError::Malformed("entry[0].changes[0]"))?
        .value
        .as_ref()
        .ok_or(InboundError::Malformed("entry[0].changes[0].value"))?;
    let message = value
        .messages
        .as_ref()
        .and_then(|m| m.first())
        .ok_or(InboundError::Malformed("value.messages[0]"))?;
    let phone_number_id = value
        .metadata
        .as_ref()
        .and_then(|m| m.phone_number_id.clone())
        .ok_or(InboundError::Malformed("value.metadata.phone_number_id"))?;
    let from = message
        .from
        .clone()
        .ok_or(InboundError::Malformed("messages[0].from"))?;
    let Some(text) = message.text.as_ref().map(|t| t.body.clone()) else {
        log::debug!(
            "webhook: {} message has no text body",
            message.message_type.as_deref().unwrap_or("untyped")
        );
        return Err(InboundError::Malformed("messages[0].text.body"));
    };
    Ok(InboundMessage {
        message_id: message.id.clone(),
        from,
        text,
        phone_number_id,
    })
}

/// Outcome of a `GET /webhook` subscription check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCheck {
    /// Echo this challenge back with 200.
    Verified(String),
    /// Mode or token wrong: 403.
    Forbidden,
    /// Mode or token missing: 400.
    BadRequest,
}

/// Check Meta's subscription handshake (`hub.mode`, `hub.verify_token`, `hub.challenge`).
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: &str,
) -> SubscriptionCheck {
    let (Some(mode), Some(token)) = (mode, token) else {
        return SubscriptionCheck::BadRequest;
    };
    if mode == "subscribe" && constant_time_eq(token, expected_token) {
        SubscriptionCheck::Verified(challenge.unwrap_or_default().to_string())
    } else {
        SubscriptionCheck::Forbidden
    }
}

/// Verify the `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw body.
pub fn verify_signature(body: &[u8], signature_header: &str, app_secret: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        log::warn!("webhook: signature header missing sha256= prefix");
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Sends replies through `POST {graph}/{version}/{phone_number_id}/messages`.
pub struct WhatsAppChannel {
    id: String,
    token: String,
    api_base: String,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(token: impl Into<String>, graph_api_base: &str, graph_api_version: &str) -> Self {
        Self {
            id: CHANNEL_ID.to_string(),
            token: token.into(),
            api_base: format!(
                "{}/{}",
                graph_api_base.trim_end_matches('/'),
                graph_api_version.trim_matches('/')
            ),
            client: reqwest::Client::new(),
        }
    }

    /// Send a text message from `target.phone_number_id` to `target.to`.
    pub async fn send_text(&self, target: &ReplyTarget, text: &str) -> Result<(), ChannelError> {
        let url = format!("{}/{}/messages", self.api_base, target.phone_number_id);
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": target.to,
            "text": { "body": text },
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("send failed: {} {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for WhatsAppChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_message(&self, target: &ReplyTarget, text: &str) -> Result<(), ChannelError> {
        self.send_text(target, text).await
    }
}
