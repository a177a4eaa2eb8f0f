//! Bearer-key authentication for the API and admin surfaces.

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;

/// Static keys guarding the proxy and admin surfaces.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub api_key: String,
    pub admin_key: String,
}

pub async fn api_auth_middleware(
    State(security): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let presented = bearer_key(&request).or_else(|| {
        // WebSocket clients often cannot set headers; accept a query token
        // there and only there.
        if request.uri().path().ends_with("/ws") {
            query_token(&request)
        } else {
            None
        }
    });

    if presented.as_deref() == Some(security.api_key.as_str()) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

pub async fn admin_auth_middleware(
    State(security): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    if bearer_key(&request).as_deref() == Some(security.admin_key.as_str()) {
        next.run(request).await
    } else {
        unauthorized()
    }
}

fn bearer_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s).trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == "token" || name == "api_key").then(|| value.to_string())
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Missing or invalid Authorization header" })),
    )
        .into_response()
}
