use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde_json::{Value, json};

use super::super::AppState;
use super::super::error::{ApiError, ApiResult};
use super::ProjectQuery;
use crate::core::dispatch::TriggerOutcome;
use crate::core::message::MessageId;

/// Starts handling one message right away. Answers as soon as the handling
/// task is spawned; the reply shows up in the chat log later.
pub async fn process_message(
    Path(message_id): Path<MessageId>,
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let project_id = query.require()?;
    let outcome = state
        .scheduler
        .dispatcher()
        .trigger(project_id, message_id)
        .await?;

    match outcome {
        TriggerOutcome::Accepted => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "status": "accepted",
                "messageId": message_id,
            })),
        )),
        TriggerOutcome::AlreadyRunning => Err(ApiError::Conflict(format!(
            "Message {} is already being processed",
            message_id
        ))),
        TriggerOutcome::AlreadyAnswered => Err(ApiError::Conflict(format!(
            "Message {} was already answered, retry it instead",
            message_id
        ))),
        TriggerOutcome::ProjectNotFound => Err(ApiError::NotFound(format!(
            "Project '{}' not found",
            project_id
        ))),
        TriggerOutcome::MessageNotFound => Err(ApiError::NotFound(format!(
            "Message {} not found",
            message_id
        ))),
    }
}
