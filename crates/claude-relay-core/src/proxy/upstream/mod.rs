//! Upstream claude.ai web client.
//!
//! Drives one web conversation per relayed request: organization lookup,
//! conversation create, completion SSE, image upload, delete.

mod client;
mod sse;

pub use client::{ClaudeWebClient, UpstreamError};
pub use sse::{CompletionEvent, SseParser};
