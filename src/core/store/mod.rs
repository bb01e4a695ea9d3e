//! Collaborator stores the dispatch core reads and writes: the per-project chat
//! log, the project registry and the agent directory.

mod agents;
mod chat_log;
mod projects;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::message::{Message, MessageDraft, MessageId, RetryOutcome};

pub use agents::FsAgentDirectory;
pub use chat_log::JsonChatLog;
pub use projects::{JsonProjectRegistry, Project};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("project not found: {0}")]
    ProjectNotFound(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One closure-based edit applied to a stored message under the project's write lock.
pub type MessageEdit = Box<dyn FnOnce(&mut Message) + Send>;

/// Ordered per-project message log.
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn read_all(&self, project_id: &str) -> StoreResult<Vec<Message>>;

    /// Stores `draft` at the end of the log and returns it with its assigned id.
    async fn append(&self, project_id: &str, draft: MessageDraft) -> StoreResult<Message>;

    /// Appends an agent reply, but only while the message named by its
    /// `in_reply_to` is still stored and `processing`. `None` when the reply
    /// was dropped because that message was discarded or reset meanwhile.
    async fn append_reply(
        &self,
        project_id: &str,
        draft: MessageDraft,
    ) -> StoreResult<Option<Message>>;

    /// Replaces the stored message with the same id. `None` if it no longer exists.
    async fn edit_in_place(&self, project_id: &str, message: Message)
    -> StoreResult<Option<Message>>;

    async fn find_by_id(&self, project_id: &str, id: MessageId) -> StoreResult<Option<Message>>;

    async fn clear(&self, project_id: &str) -> StoreResult<()>;

    /// Applies `edit` to the stored message atomically with respect to other writers.
    async fn modify(
        &self,
        project_id: &str,
        id: MessageId,
        edit: MessageEdit,
    ) -> StoreResult<Option<Message>>;

    /// Resets a terminal message to `waiting` and discards every later message.
    async fn retry(&self, project_id: &str, id: MessageId) -> StoreResult<RetryOutcome>;
}

#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn list_all(&self) -> StoreResult<Vec<Project>>;

    async fn get(&self, project_id: &str) -> StoreResult<Option<Project>>;

    async fn set_paused(&self, project_id: &str, paused: bool) -> StoreResult<Project>;

    fn working_dir(&self, project: &Project) -> PathBuf;

    /// Projects the scheduler should scan: everything not paused.
    async fn list_active(&self) -> StoreResult<Vec<Project>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|p| !p.paused)
            .collect())
    }
}

pub trait AgentDirectory: Send + Sync {
    fn list_agent_names(&self) -> Vec<String>;
}

pub type SharedChatLog = Arc<dyn ChatLog>;
pub type SharedProjects = Arc<dyn ProjectRegistry>;
pub type SharedAgents = Arc<dyn AgentDirectory>;

/// Writes `content` to a sibling temp file and renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}
