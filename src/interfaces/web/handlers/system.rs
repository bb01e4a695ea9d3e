use axum::{Json, extract::State};
use serde_json::{Value, json};

use super::super::AppState;

pub async fn scheduler_stats(State(state): State<AppState>) -> Json<Value> {
    let mut body = json!(state.scheduler.stats());
    if let Some(obj) = body.as_object_mut() {
        obj.insert("success".to_string(), json!(true));
    }
    Json(body)
}

pub async fn normalizer_health(State(state): State<AppState>) -> Json<Value> {
    let available = state.normalizer.is_available().await;
    Json(json!({
        "success": true,
        "available": available,
        "url": state.normalizer.base_url(),
        "interpreter": state.scheduler.dispatcher().interpreter().name(),
    }))
}
