pub mod admin;
pub mod chat;
pub mod models;
pub mod ws;

use axum::Json;
use serde_json::{json, Value};

pub async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
