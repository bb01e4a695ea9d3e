pub(super) mod agents;
pub(super) mod messages;
pub(super) mod processor;
pub(super) mod projects;
pub(super) mod system;

use serde::Deserialize;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::core::store::Project;

/// `?projectId=` selector shared by the chat-log routes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectQuery {
    pub project_id: Option<String>,
}

impl ProjectQuery {
    fn require(&self) -> ApiResult<&str> {
        self.project_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("projectId is required".to_string()))
    }
}

async fn resolve_project(state: &AppState, query: &ProjectQuery) -> ApiResult<Project> {
    let id = query.require()?;
    state
        .projects
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project '{}' not found", id)))
}
