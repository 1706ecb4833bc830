//! Hosted assistant provider.
//!
//! OpenAI Assistants API client (threads, messages, runs) behind the `AssistantBackend` trait.

mod assistants;

pub use assistants::{
    AssistantBackend, AssistantError, AssistantsClient, ContentBlock, MessageRole, Run, RunError,
    RunStatus, TextContent, Thread, ThreadMessage,
};
