use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::{ProjectRegistry, StoreError, StoreResult, write_atomic};

pub const PROJECTS_FILE: &str = "projects.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub paused: bool,
    /// Explicit working directory; defaults to `projects/<id>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<Project>,
}

/// Registry kept in `<data>/projects.json`.
pub struct JsonProjectRegistry {
    file: PathBuf,
    projects_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonProjectRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: data_dir.join(PROJECTS_FILE),
            projects_dir: data_dir.join("projects"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    async fn load(&self) -> StoreResult<ProjectsFile> {
        match tokio::fs::read(&self.file).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::json(&self.file, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectsFile::default()),
            Err(e) => Err(StoreError::io(&self.file, e)),
        }
    }
}

#[async_trait]
impl ProjectRegistry for JsonProjectRegistry {
    async fn list_all(&self) -> StoreResult<Vec<Project>> {
        Ok(self.load().await?.projects)
    }

    async fn get(&self, project_id: &str) -> StoreResult<Option<Project>> {
        Ok(self
            .load()
            .await?
            .projects
            .into_iter()
            .find(|p| p.id == project_id))
    }

    async fn set_paused(&self, project_id: &str, paused: bool) -> StoreResult<Project> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await?;
        let project = file
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
        project.paused = paused;
        let updated = project.clone();

        let json =
            serde_json::to_vec_pretty(&file).map_err(|e| StoreError::json(&self.file, e))?;
        write_atomic(&self.file, &json).await?;
        info!("Project {} paused={}", project_id, paused);
        Ok(updated)
    }

    fn working_dir(&self, project: &Project) -> PathBuf {
        project
            .folder
            .clone()
            .unwrap_or_else(|| self.projects_dir.join(&project.id))
    }
}
