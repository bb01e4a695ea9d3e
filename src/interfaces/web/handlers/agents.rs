use axum::{Json, extract::State};
use serde_json::{Value, json};

use super::super::AppState;

pub async fn get_agents(State(state): State<AppState>) -> Json<Value> {
    let agents = state.agents.list_agent_names();
    let config = state.scheduler.dispatcher().invoker().config();
    Json(json!({
        "success": true,
        "agents": agents,
        "defaultAgent": config.default_agent,
        "coordinator": config.coordinator,
    }))
}
