//! Waybot core library: relays WhatsApp messages to an OpenAI assistant and sends the
//! reply back. Shared by the CLI's `serve` and `ask` commands.

pub mod agent;
pub mod channels;
pub mod config;
pub mod dedupe;
pub mod gateway;
pub mod llm;
