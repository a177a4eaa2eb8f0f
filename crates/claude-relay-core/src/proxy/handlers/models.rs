//! Model catalogue.

use axum::Json;
use serde_json::{json, Value};

/// Models the upstream web surface accepts; each also has a `-think`
/// variant enabling extended thinking.
const MODELS: &[&str] = &[
    "claude-3-7-sonnet-20250219",
    "claude-sonnet-4-20250514",
    "claude-opus-4-20250514",
];

pub async fn handle_list_models() -> Json<Value> {
    let mut data = Vec::with_capacity(MODELS.len() * 2);
    for model in MODELS {
        data.push(json!({ "id": model }));
        data.push(json!({ "id": format!("{model}-think") }));
    }
    Json(json!({ "data": data }))
}
