//! Claude Relay - Headless Daemon
//!
//! An OpenAI-compatible HTTP facade that multiplexes chat-completion
//! requests over a pool of Claude web-session credentials:
//! - `/v1/*` (and `/hf/v1/*`) — chat completions and models
//! - `/admin/*` — pool CRUD, stats, runtime config
//! - `/ws` — live health and stats telemetry

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use claude_relay_core::modules::{config, logger};
use claude_relay_core::proxy::{AppState, RelayServer, TelemetryHub};
use claude_relay_core::SessionScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logger();

    let config = config::load_config().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    info!(
        sessions = config.sessions.len(),
        scheduler_enabled = config.scheduler.enabled,
        strategy = %config.scheduler.schedule_strategy,
        min_health_score = config.scheduler.min_health_score,
        max_retry_attempts = config.scheduler.max_retry_attempts,
        "configuration loaded"
    );
    for session in &config.sessions {
        info!(
            session = %logger::mask_secret(&session.session_key),
            org_id = session.org_id.as_deref().unwrap_or(""),
            "pooled session"
        );
    }

    let scheduler = Arc::new(SessionScheduler::new(
        config.sessions.clone(),
        config.scheduler_config(),
    ));

    let telemetry = Arc::new(TelemetryHub::new(Arc::clone(&scheduler)));
    telemetry.start();

    let state = AppState::new(scheduler, telemetry, &config);
    let server = RelayServer::new(config.address.clone(), state, &config);

    info!(address = %config.address, "claude-relay ready");
    server.run().await.context("server terminated")?;

    Ok(())
}
