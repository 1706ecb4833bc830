//! Gateway HTTP server: health probe and the WhatsApp webhook.

use crate::agent::{self, PollPolicy};
use crate::channels::{
    self, ChannelHandle, InboundError, SubscriptionCheck, WhatsAppChannel,
};
use crate::config::{self, Config, WebhookSettings};
use crate::dedupe::SeenMessages;
use crate::llm::{AssistantBackend, AssistantsClient};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Body of `GET /`.
pub const HEALTH_TEXT: &str = "WhatsApp Travel Bot is running!";

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub assistant: Arc<dyn AssistantBackend>,
    pub assistant_id: String,
    pub poll: PollPolicy,
    /// Delivers replies (WhatsApp in production).
    pub channel: Arc<dyn ChannelHandle>,
    pub verify_token: String,
    /// When Some, POST bodies must carry a valid X-Hub-Signature-256.
    pub app_secret: Option<String>,
    pub seen: Arc<SeenMessages>,
    /// Cancelled on shutdown; in-flight run polling stops and the fallback reply is sent.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(
        config: Config,
        assistant: Arc<dyn AssistantBackend>,
        assistant_id: impl Into<String>,
        channel: Arc<dyn ChannelHandle>,
        webhook: WebhookSettings,
    ) -> Self {
        let poll = PollPolicy::from(&config.assistant);
        let seen = Arc::new(SeenMessages::new(config.whatsapp.dedupe_window));
        Self {
            assistant,
            assistant_id: assistant_id.into(),
            poll,
            channel,
            verify_token: webhook.verify_token,
            app_secret: webhook.app_secret,
            seen,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Routes: `GET /`, `GET /webhook`, `POST /webhook`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Fails fast when assistant or webhook credentials are missing.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let assistant_settings = config::resolve_assistant_settings(&config)?;
    let webhook = config::resolve_webhook_settings(&config)?;
    if webhook.app_secret.is_none() {
        log::warn!("no WhatsApp app secret configured; webhook signatures will not be checked");
    }

    let assistant = AssistantsClient::new(
        Some(config.assistant.base_url.clone()),
        assistant_settings.api_key,
    );
    let channel = WhatsAppChannel::new(
        webhook.access_token.clone(),
        &config.whatsapp.graph_api_base,
        &config.whatsapp.graph_api_version,
    );
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let state = GatewayState::new(
        config,
        Arc::new(assistant),
        assistant_settings.assistant_id,
        Arc::new(channel),
        webhook,
    );
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Cancels `shutdown` so in-flight webhook requests stop polling and can drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining webhook requests");
    shutdown.cancel();
}

/// GET / returns a plain availability string (for probes).
async fn health_http() -> &'static str {
    HEALTH_TEXT
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhook — Meta subscription handshake; echoes hub.challenge when the token matches.
async fn webhook_verify(
    State(state): State<GatewayState>,
    Query(q): Query<VerifyQuery>,
) -> Response {
    match channels::verify_subscription(
        q.mode.as_deref(),
        q.verify_token.as_deref(),
        q.challenge.as_deref(),
        &state.verify_token,
    ) {
        SubscriptionCheck::Verified(challenge) => {
            log::info!("webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        SubscriptionCheck::Forbidden => {
            log::warn!("webhook: verification failed (mode or token mismatch)");
            StatusCode::FORBIDDEN.into_response()
        }
        SubscriptionCheck::BadRequest => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// POST /webhook — validate the payload, ask the assistant, and send the reply.
/// 400 for malformed payloads, 403 for bad signatures, 500 when the reply cannot be sent.
async fn webhook_receive(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref secret) = state.app_secret {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !channels::verify_signature(&body, provided, secret) {
            log::warn!("webhook: signature check failed");
            return StatusCode::FORBIDDEN;
        }
    }

    let msg = match channels::parse_inbound(&body) {
        Ok(m) => m,
        Err(InboundError::Malformed(what)) => {
            log::debug!("webhook: ignoring payload without {}", what);
            return StatusCode::BAD_REQUEST;
        }
        Err(e) => {
            log::warn!("webhook: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Some(ref id) = msg.message_id {
        if !state.seen.first_sighting(id).await {
            log::info!("webhook: duplicate delivery of {}, skipping", id);
            return StatusCode::OK;
        }
    }

    log::info!("received message: {} from {}", msg.text, msg.from);

    let reply = agent::get_reply(
        state.assistant.as_ref(),
        &state.assistant_id,
        &state.poll,
        &state.shutdown,
        &msg.text,
    )
    .await;

    match state
        .channel
        .send_message(&msg.reply_target(), &reply)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            log::error!("webhook: {} reply to {} failed: {}", state.channel.id(), msg.from, e);
            // Meta redelivers on 5xx; the redelivery must not be dropped as a duplicate.
            if let Some(ref id) = msg.message_id {
                state.seen.forget(id).await;
            }
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
