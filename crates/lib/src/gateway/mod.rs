//! Gateway: HTTP server for the WhatsApp webhook.
//!
//! Single port serves the health probe, the subscription handshake, and message delivery.
//! Each POST runs one relay turn to completion before answering.

mod server;

pub use server::{router, run_gateway, GatewayState, HEALTH_TEXT};
