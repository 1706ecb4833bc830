//! Configuration types and loading.
//!
//! Config is loaded from an optional JSON file (e.g. `~/.waybot/config.json`) and environment.
//! Environment variables win over the file so a plain `.env` deployment needs no file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// OpenAI Assistants settings.
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// WhatsApp Cloud API settings.
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 3000). Overridden by PORT env.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "0.0.0.0"; the webhook must be reachable by Meta). Overridden by BIND env.
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

/// Assistant identity, credentials, and run polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConfig {
    /// API key. Overridden by OPENAI_API_KEY env.
    pub api_key: Option<String>,

    /// Pre-created assistant id (asst_...). Overridden by OPENAI_ASSISTANT_ID env.
    pub assistant_id: Option<String>,

    /// API base including the version segment (default https://api.openai.com/v1). Overridden by OPENAI_BASE_URL env.
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Wait between run status checks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Status checks before a run is abandoned as timed out.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

/// WhatsApp webhook verification and send API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    /// Token Meta echoes back in `hub.verify_token`. Overridden by VERIFY_TOKEN env.
    pub verify_token: Option<String>,

    /// Bearer token for the Graph API send endpoint. Overridden by WHATSAPP_TOKEN env.
    pub access_token: Option<String>,

    /// App secret for `X-Hub-Signature-256` checks. When unset, signatures are not checked. Overridden by WHATSAPP_APP_SECRET env.
    pub app_secret: Option<String>,

    #[serde(default = "default_graph_api_base")]
    pub graph_api_base: String,

    #[serde(default = "default_graph_api_version")]
    pub graph_api_version: String,

    /// How many recent message ids are remembered to drop redelivered webhooks. 0 disables.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_poll_attempts() -> u32 {
    60
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_graph_api_version() -> String {
    "v17.0".to_string()
}

fn default_dedupe_window() -> usize {
    1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            assistant_id: None,
            base_url: default_openai_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            access_token: None,
            app_secret: None,
            graph_api_base: default_graph_api_base(),
            graph_api_version: default_graph_api_version(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

impl AssistantConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Non-empty trimmed env var, if set.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Env var `name` if set, otherwise the trimmed config value (blank counts as unset).
fn env_or(name: &str, configured: Option<&String>) -> Option<String> {
    env_value(name).or_else(|| {
        configured
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the OpenAI API key: env OPENAI_API_KEY overrides config.
pub fn resolve_api_key(config: &Config) -> Option<String> {
    env_or("OPENAI_API_KEY", config.assistant.api_key.as_ref())
}

/// Resolve the assistant id: env OPENAI_ASSISTANT_ID overrides config.
pub fn resolve_assistant_id(config: &Config) -> Option<String> {
    env_or("OPENAI_ASSISTANT_ID", config.assistant.assistant_id.as_ref())
}

/// Resolve the webhook verify token: env VERIFY_TOKEN overrides config.
pub fn resolve_verify_token(config: &Config) -> Option<String> {
    env_or("VERIFY_TOKEN", config.whatsapp.verify_token.as_ref())
}

/// Resolve the Graph API bearer token: env WHATSAPP_TOKEN overrides config.
pub fn resolve_whatsapp_token(config: &Config) -> Option<String> {
    env_or("WHATSAPP_TOKEN", config.whatsapp.access_token.as_ref())
}

/// Resolve the app secret used for payload signatures: env WHATSAPP_APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_or("WHATSAPP_APP_SECRET", config.whatsapp.app_secret.as_ref())
}

/// Apply PORT, BIND and OPENAI_BASE_URL env overrides in place. An unparsable PORT is an error.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(port) = env_value("PORT") {
        config.gateway.port = port
            .parse()
            .with_context(|| format!("parsing PORT={}", port))?;
    }
    if let Some(bind) = env_value("BIND") {
        config.gateway.bind = bind;
    }
    if let Some(base) = env_value("OPENAI_BASE_URL") {
        config.assistant.base_url = base;
    }
    Ok(())
}

/// Credentials needed to talk to the assistant.
#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub api_key: String,
    pub assistant_id: String,
}

/// Credentials needed to serve the webhook.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub verify_token: String,
    pub access_token: String,
    pub app_secret: Option<String>,
}

/// Resolve assistant credentials; fails naming the first missing variable.
pub fn resolve_assistant_settings(config: &Config) -> Result<AssistantSettings> {
    let api_key = resolve_api_key(config)
        .context("assistant API key not configured (set OPENAI_API_KEY or assistant.apiKey)")?;
    let assistant_id = resolve_assistant_id(config).context(
        "assistant id not configured (set OPENAI_ASSISTANT_ID or assistant.assistantId)",
    )?;
    Ok(AssistantSettings {
        api_key,
        assistant_id,
    })
}

/// Resolve webhook credentials; fails naming the first missing variable.
pub fn resolve_webhook_settings(config: &Config) -> Result<WebhookSettings> {
    let verify_token = resolve_verify_token(config)
        .context("webhook verify token not configured (set VERIFY_TOKEN or whatsapp.verifyToken)")?;
    let access_token = resolve_whatsapp_token(config).context(
        "whatsapp access token not configured (set WHATSAPP_TOKEN or whatsapp.accessToken)",
    )?;
    Ok(WebhookSettings {
        verify_token,
        access_token,
        app_secret: resolve_app_secret(config),
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("WAYBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".waybot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Env overrides for port, bind and base URL are applied before returning.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config)?;
    Ok((config, path))
}
