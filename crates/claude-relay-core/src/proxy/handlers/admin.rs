//! Admin surface: pool CRUD, per-session reset, stats, runtime config.
//!
//! Every pool mutation broadcasts a `session_change` frame plus a fresh
//! sessions snapshot to WebSocket subscribers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;

use super::chat::error_response;
use crate::proxy::server::AppState;
use crate::scheduler::SessionInfo;

static SESSION_KEY_RE: OnceLock<Regex> = OnceLock::new();

const MIN_SESSION_KEY_LEN: usize = 10;

fn is_valid_session_key(key: &str) -> bool {
    if key.len() < MIN_SESSION_KEY_LEN {
        return false;
    }
    let re = SESSION_KEY_RE.get_or_init(|| {
        Regex::new(r"^(sk-|sk-ant-)[A-Za-z0-9_-]+$").expect("session key regex")
    });
    re.is_match(key)
}

pub async fn list_sessions(State(state): State<AppState>) -> Response {
    Json(state.scheduler.list_health()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddSessionRequest {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "orgID", default)]
    pub org_id: Option<String>,
}

pub async fn add_session(
    State(state): State<AppState>,
    Json(request): Json<AddSessionRequest>,
) -> Response {
    let key = request.session_key.trim().to_string();
    if !is_valid_session_key(&key) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid session key format. Session key should start with 'sk-' or 'sk-ant-'",
        );
    }

    let session = SessionInfo::new(key.clone(), request.org_id);
    if !state.scheduler.add_session(session.clone()) {
        return error_response(StatusCode::CONFLICT, "Session already exists");
    }

    state.telemetry.broadcast_session_change(&key, "added");
    (
        StatusCode::CREATED,
        Json(json!({ "message": "Session added successfully", "session": session })),
    )
        .into_response()
}

pub async fn session_detail(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    match state.scheduler.session_health(&key) {
        Some(health) => Json(health).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(rename = "orgID", default)]
    pub org_id: Option<String>,
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Response {
    if !state.scheduler.update_org_id(&key, request.org_id) {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    }

    state.telemetry.broadcast_session_change(&key, "updated");
    Json(json!({ "message": "Session updated successfully" })).into_response()
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    if !state.scheduler.remove_session(&key) {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    }

    state.telemetry.broadcast_session_change(&key, "deleted");
    Json(json!({ "message": "Session deleted successfully" })).into_response()
}

pub async fn reset_session(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    if !state.scheduler.reset_session(&key) {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    }

    state.telemetry.broadcast_session_change(&key, "reset");
    Json(json!({ "message": "Session reset successfully", "session": key })).into_response()
}

pub async fn stats(State(state): State<AppState>) -> Response {
    let stats = state.scheduler.stats();
    let uptime = (Utc::now() - state.scheduler.start_time()).num_seconds();

    Json(json!({
        "total_sessions": state.scheduler.session_count(),
        "active_sessions": stats.sessions_active,
        "cooling_sessions": stats.sessions_cooling,
        "failed_sessions": stats.sessions_failed,
        "total_requests": stats.total_requests,
        "successful_requests": stats.successful_requests,
        "failed_requests": stats.failed_requests,
        "average_latency": stats.average_latency.as_millis() as u64,
        "uptime": format!("{uptime}s"),
        "last_reset": stats.last_reset,
        "errors_by_kind": stats.errors_by_kind,
    }))
    .into_response()
}

pub async fn get_config(State(state): State<AppState>) -> Response {
    let settings = state.settings.read().await.clone();
    let scheduler_config = state.scheduler.config();

    Json(json!({
        "schedulerEnabled": settings.scheduler_enabled,
        "totalSessions": state.scheduler.session_count(),
        "chatDelete": settings.chat_delete,
        "maxChatHistoryLength": settings.max_chat_history_length,
        "noRolePrefix": settings.no_role_prefix,
        "enableMirrorApi": settings.enable_mirror_api,
        "mirrorApiPrefix": settings.mirror_api_prefix,
        "scheduler": {
            "scheduleStrategy": scheduler_config.strategy.to_string(),
            "activeStrategy": state.scheduler.strategy_name(),
            "maxRetryAttempts": state.scheduler.max_retry_attempts(),
            "healthCheckInterval": scheduler_config.health_check_interval.as_secs(),
            "minHealthScore": scheduler_config.min_health_score,
            "circuitBreakerEnabled": scheduler_config.circuit_breaker_enabled,
        },
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    pub scheduler_enabled: Option<bool>,
    pub chat_delete: Option<bool>,
    pub max_chat_history_length: Option<usize>,
    pub no_role_prefix: Option<bool>,
    pub enable_mirror_api: Option<bool>,
    pub max_retry_attempts: Option<u32>,
    pub schedule_strategy: Option<String>,
}

pub async fn update_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateConfigRequest>,
) -> Response {
    {
        let mut settings = state.settings.write().await;
        if let Some(enabled) = request.scheduler_enabled {
            settings.scheduler_enabled = enabled;
        }
        if let Some(chat_delete) = request.chat_delete {
            settings.chat_delete = chat_delete;
        }
        if let Some(limit) = request.max_chat_history_length {
            settings.max_chat_history_length = limit;
        }
        if let Some(no_role_prefix) = request.no_role_prefix {
            settings.no_role_prefix = no_role_prefix;
        }
        if let Some(enable_mirror) = request.enable_mirror_api {
            settings.enable_mirror_api = enable_mirror;
        }
    }

    if let Some(attempts) = request.max_retry_attempts {
        state.scheduler.set_max_retry_attempts(attempts);
    }

    // The strategy is wired into the scheduler at construction time.
    let note = match request.schedule_strategy.as_deref() {
        Some(strategy) => {
            tracing::info!(
                requested = strategy,
                active = %state.scheduler.config().strategy,
                "schedule strategy change requested; takes effect after restart"
            );
            Some("schedule strategy changes require a restart")
        },
        None => None,
    };

    Json(json!({ "message": "Configuration updated successfully", "note": note }))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_validation() {
        assert!(is_valid_session_key("sk-ant-sid01-abcdef"));
        assert!(is_valid_session_key("sk-abcdefghij"));
        assert!(!is_valid_session_key("sk-short"));
        assert!(!is_valid_session_key("key-without-prefix"));
        assert!(!is_valid_session_key("sk-ant-has spaces"));
        assert!(!is_valid_session_key(""));
    }
}
