//! Axum application state and router assembly.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::error::AppResult;
use crate::modules::config::Config;
use crate::proxy::handlers;
use crate::proxy::middleware::{
    admin_auth_middleware, api_auth_middleware, cors_layer, SecurityConfig,
};
use crate::proxy::telemetry::TelemetryHub;
use crate::scheduler::SessionScheduler;

/// Settings the admin surface can change at runtime.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub scheduler_enabled: bool,
    pub chat_delete: bool,
    pub max_chat_history_length: usize,
    pub no_role_prefix: bool,
    pub enable_mirror_api: bool,
    pub mirror_api_prefix: String,
    pub proxy: Option<String>,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scheduler_enabled: config.scheduler.enabled,
            chat_delete: config.chat_delete,
            max_chat_history_length: config.max_chat_history_length,
            no_role_prefix: config.no_role_prefix,
            enable_mirror_api: config.enable_mirror_api,
            mirror_api_prefix: config.mirror_api_prefix.clone(),
            proxy: config.proxy.clone(),
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SessionScheduler>,
    pub telemetry: Arc<TelemetryHub>,
    pub settings: Arc<RwLock<RuntimeSettings>>,
    pub security: Arc<SecurityConfig>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<SessionScheduler>,
        telemetry: Arc<TelemetryHub>,
        config: &Config,
    ) -> Self {
        Self {
            scheduler,
            telemetry,
            settings: Arc::new(RwLock::new(RuntimeSettings::from_config(config))),
            security: Arc::new(SecurityConfig {
                api_key: config.api_key.clone(),
                admin_key: config.admin_key().to_string(),
            }),
        }
    }
}

/// Builds the full route table: OpenAI surface (plus the HuggingFace-style
/// alias), admin CRUD, WebSocket telemetry, and the optional mirror path.
pub fn build_router(state: AppState, config: &Config) -> Router {
    let security = Arc::clone(&state.security);

    let api = Router::new()
        .route("/chat/completions", post(handlers::chat::handle_chat_completions))
        .route("/models", get(handlers::models::handle_list_models))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&security),
            api_auth_middleware,
        ));

    let admin = Router::new()
        .route("/sessions", get(handlers::admin::list_sessions).post(handlers::admin::add_session))
        .route(
            "/sessions/:key",
            get(handlers::admin::session_detail)
                .put(handlers::admin::update_session)
                .delete(handlers::admin::delete_session),
        )
        .route("/sessions/:key/reset", post(handlers::admin::reset_session))
        .route("/stats", get(handlers::admin::stats))
        .route("/config", get(handlers::admin::get_config).put(handlers::admin::update_config))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&security),
            admin_auth_middleware,
        ));

    let ws = Router::new()
        .route("/ws", get(handlers::ws::handle_ws))
        .route_layer(middleware::from_fn_with_state(security, api_auth_middleware));

    let mut router = Router::new()
        .route("/health", get(handlers::handle_health))
        .nest("/v1", api.clone())
        .nest("/hf/v1", api)
        .nest("/admin", admin)
        .merge(ws);

    // The mirror path carries its own credential, so no API-key layer.
    if !config.mirror_api_prefix.is_empty() {
        let prefix = if config.mirror_api_prefix.starts_with('/') {
            config.mirror_api_prefix.clone()
        } else {
            format!("/{}", config.mirror_api_prefix)
        };
        let mirror = Router::new()
            .route("/chat/completions", post(handlers::chat::handle_mirror_chat))
            .route("/models", get(handlers::models::handle_list_models));
        router = router.nest(&format!("{prefix}/v1"), mirror);
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_allowed_origins))
        .with_state(state)
}

/// Bound Axum server.
pub struct RelayServer {
    address: String,
    router: Router,
}

impl RelayServer {
    pub fn new(address: String, state: AppState, config: &Config) -> Self {
        let router = build_router(state, config);
        Self { address, router }
    }

    pub async fn run(self) -> AppResult<()> {
        tracing::info!(address = %self.address, "starting relay server");
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        axum::serve(listener, self.router).await?;
        Ok(())
    }
}
