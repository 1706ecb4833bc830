//! OpenAI Assistants API (v2) client: threads, messages, and runs.
//!
//! Only the calls the relay needs are implemented. Every request carries the
//! `OpenAI-Beta: assistants=v2` header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("assistant api error: {0}")]
    Api(String),
    #[error("unexpected assistant response: {0}")]
    Decode(String),
}

/// Provider operations used by the relay workflow. Implemented by [`AssistantsClient`];
/// tests substitute scripted fakes.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// POST /threads — new empty thread.
    async fn create_thread(&self) -> Result<Thread, AssistantError>;

    /// POST /threads/{thread_id}/messages — append a user message.
    async fn add_user_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<ThreadMessage, AssistantError>;

    /// POST /threads/{thread_id}/runs — start a run with the given assistant.
    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, AssistantError>;

    /// GET /threads/{thread_id}/runs/{run_id}
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError>;

    /// GET /threads/{thread_id}/messages — provider order (newest first).
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError>;
}

/// Client for the hosted Assistants API.
#[derive(Clone)]
pub struct AssistantsClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AssistantsClient {
    pub fn new(base_url: Option<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
    }

    /// Send the request, map non-2xx to `Api`, and decode the JSON body into `T`.
    async fn send_json<T: serde::de::DeserializeOwned>(
        req: reqwest::RequestBuilder,
    ) -> Result<T, AssistantError> {
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AssistantError::Api(format!("{} {}", status, body)));
        }
        let body = res.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| AssistantError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AssistantBackend for AssistantsClient {
    async fn create_thread(&self) -> Result<Thread, AssistantError> {
        Self::send_json(self.post("/threads").json(&serde_json::json!({}))).await
    }

    async fn add_user_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<ThreadMessage, AssistantError> {
        let body = CreateMessageRequest {
            role: MessageRole::User,
            content: text,
        };
        Self::send_json(
            self.post(&format!("/threads/{}/messages", thread_id))
                .json(&body),
        )
        .await
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, AssistantError> {
        let body = CreateRunRequest { assistant_id };
        Self::send_json(self.post(&format!("/threads/{}/runs", thread_id)).json(&body)).await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError> {
        Self::send_json(self.get(&format!("/threads/{}/runs/{}", thread_id, run_id))).await
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError> {
        let list: MessageList =
            Self::send_json(self.get(&format!("/threads/{}/messages", thread_id))).await?;
        Ok(list.data)
    }
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Run lifecycle as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    /// A status this client does not know yet.
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// The run ended without producing a usable reply.
    pub fn is_abnormal_end(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Incomplete => "incomplete",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider error detail attached to failed runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: MessageRole,
    /// Unix seconds.
    pub created_at: i64,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// One block of message content. Only text is read; images, refusals and the like are `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextContent {
    pub value: String,
}

impl ThreadMessage {
    /// Value of the first content block when that block is text.
    pub fn first_text(&self) -> Option<&str> {
        match self.content.first()? {
            ContentBlock::Text { text } => Some(text.value.as_str()),
            ContentBlock::Other => None,
        }
    }
}
