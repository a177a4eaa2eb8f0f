//! # Claude Relay Core
//!
//! Core logic for Claude Relay: an OpenAI-compatible HTTP facade that
//! multiplexes chat-completion requests over a pool of Claude web-session
//! credentials.
//!
//! ```text
//! claude-relay-core/src/
//! ├── scheduler/   ← credential pool, health model, strategies, breaker,
//! │                  retry driver, telemetry aggregation
//! ├── proxy/       ← Axum server, handlers, middleware, WebSocket hub,
//! │                  upstream claude.ai client
//! ├── modules/     ← configuration and logging
//! └── models.rs    ← OpenAI wire types and prompt flattening
//! ```

pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
pub mod scheduler;

// Re-export commonly used types
pub use error::{AppError, AppResult};
pub use scheduler::{SessionScheduler, SchedulerConfig, SessionInfo};
