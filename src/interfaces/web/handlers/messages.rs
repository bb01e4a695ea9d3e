use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use super::super::error::{ApiError, ApiResult};
use super::{ProjectQuery, resolve_project};
use crate::core::block::current_block;
use crate::core::message::{MessageDraft, MessageId, MessageStatus, Recipient, RetryOutcome};

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Json<Value>> {
    let project = resolve_project(&state, &query).await?;
    let messages = state.chat.read_all(&project.id).await?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    agent: Option<String>,
    content: Option<String>,
    #[serde(rename = "for")]
    recipient: Option<Recipient>,
    #[serde(default)]
    attached_files: Vec<String>,
}

/// A message typed by the human. The block number comes from the project's
/// working directory, never from the client.
pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
    Json(payload): Json<SendMessageRequest>,
) -> ApiResult<Json<Value>> {
    let project = resolve_project(&state, &query).await?;
    let content = payload
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("content is required".to_string()))?;

    let work_dir = state.projects.working_dir(&project);
    let agent = payload
        .agent
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| state.user().to_string());

    let mut draft = MessageDraft::new(agent, content, current_block(&work_dir));
    draft.recipient = payload.recipient.filter(|r| !r.is_empty());
    if draft.recipient.is_some() {
        draft.status = Some(MessageStatus::Waiting);
    }
    draft.attached_files = payload.attached_files;

    let message = state.chat.append(&project.id, draft).await?;
    info!(
        "Message {} posted to project {} by [{}]",
        message.id, project.id, message.agent
    );
    Ok(Json(json!({ "success": true, "message": message })))
}

pub async fn clear_messages(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Json<Value>> {
    let project = resolve_project(&state, &query).await?;
    state.chat.clear(&project.id).await?;
    state
        .scheduler
        .dispatcher()
        .ledger()
        .release_project(&project.id);
    info!("Chat of project {} cleared", project.id);
    Ok(Json(json!({ "success": true })))
}

pub async fn retry_message(
    Path(message_id): Path<MessageId>,
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Json<Value>> {
    let project = resolve_project(&state, &query).await?;
    match state.chat.retry(&project.id, message_id).await? {
        RetryOutcome::NotFound => Err(ApiError::NotFound(format!(
            "Message {} not found",
            message_id
        ))),
        RetryOutcome::NotTerminal(status) => Err(ApiError::Conflict(format!(
            "Message {} is {} and cannot be retried",
            message_id,
            status.map(MessageStatus::as_str).unwrap_or("not dispatched")
        ))),
        RetryOutcome::Reset { deleted } => {
            // the next tick may pick it up again
            state
                .scheduler
                .dispatcher()
                .ledger()
                .release(&project.id, message_id);
            info!(
                "Message {} of project {} reset for retry, {} later message(s) discarded",
                message_id, project.id, deleted
            );
            Ok(Json(json!({ "success": true, "deletedCount": deleted })))
        }
    }
}
