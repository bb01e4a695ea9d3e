use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::super::error::{ApiError, ApiResult};

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let projects: Vec<Value> = state
        .projects
        .list_all()
        .await?
        .into_iter()
        .map(|project| {
            let work_dir = state.projects.working_dir(&project);
            let mut value = json!(project);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("workingDir".to_string(), json!(work_dir));
            }
            value
        })
        .collect();
    Ok(Json(json!({ "success": true, "projects": projects })))
}

/// Flips the paused flag. Paused projects are skipped by the scheduler.
pub async fn toggle_pause(
    Path(project_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let project = state
        .projects
        .get(&project_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project '{}' not found", project_id)))?;
    let updated = state.projects.set_paused(&project.id, !project.paused).await?;
    Ok(Json(json!({ "success": true, "project": updated })))
}
