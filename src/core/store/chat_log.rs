use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChatLog, MessageEdit, StoreError, StoreResult, write_atomic};
use crate::core::message::{
    Message, MessageDraft, MessageId, MessageStatus, RetryOutcome, reset_for_retry,
};

pub const CHAT_FILE: &str = "chat.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChatFile {
    #[serde(default)]
    messages: Vec<Message>,
}

/// `projects/<id>/chat.json` backed log. Writers of one project are serialized
/// through a per-project mutex, and every write replaces the file atomically.
pub struct JsonChatLog {
    projects_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonChatLog {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn chat_file(&self, project_id: &str) -> PathBuf {
        self.projects_dir.join(project_id).join(CHAT_FILE)
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(path: &Path) -> StoreResult<Vec<Message>> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => {
                let file: ChatFile =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::json(path, e))?;
                Ok(file.messages)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    async fn save(path: &Path, messages: Vec<Message>) -> StoreResult<()> {
        let file = ChatFile { messages };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| StoreError::json(path, e))?;
        write_atomic(path, &json).await
    }

    /// Runs a read-modify-write cycle over the whole log under the project lock.
    async fn update<R>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Vec<Message>) -> (R, bool),
    ) -> StoreResult<R> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;

        let path = self.chat_file(project_id);
        let mut messages = Self::load(&path).await?;
        let (result, dirty) = f(&mut messages);
        if dirty {
            Self::save(&path, messages).await?;
        }
        Ok(result)
    }
}

/// Next id: wall-clock millis, bumped past the last stored id when the clock
/// has not moved on (or went backwards).
fn next_message_id(messages: &[Message]) -> MessageId {
    let now = chrono::Utc::now().timestamp_millis().max(0) as MessageId;
    let last = messages.iter().map(|m| m.id).max().unwrap_or(0);
    now.max(last + 1)
}

#[async_trait]
impl ChatLog for JsonChatLog {
    async fn read_all(&self, project_id: &str) -> StoreResult<Vec<Message>> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        Self::load(&self.chat_file(project_id)).await
    }

    async fn append(&self, project_id: &str, draft: MessageDraft) -> StoreResult<Message> {
        self.update(project_id, |messages| {
            let id = next_message_id(messages);
            let message = draft.into_message(id, project_id);
            messages.push(message.clone());
            debug!("Appended message {} to project {}", id, project_id);
            (message, true)
        })
        .await
    }

    async fn append_reply(
        &self,
        project_id: &str,
        draft: MessageDraft,
    ) -> StoreResult<Option<Message>> {
        self.update(project_id, |messages| {
            let origin_live = draft.in_reply_to.is_some_and(|origin| {
                messages
                    .iter()
                    .any(|m| m.id == origin && m.status == Some(MessageStatus::Processing))
            });
            if !origin_live {
                return (None, false);
            }
            let id = next_message_id(messages);
            let message = draft.into_message(id, project_id);
            messages.push(message.clone());
            debug!("Appended reply {} to project {}", id, project_id);
            (Some(message), true)
        })
        .await
    }

    async fn edit_in_place(
        &self,
        project_id: &str,
        message: Message,
    ) -> StoreResult<Option<Message>> {
        self.update(project_id, |messages| {
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(slot) => {
                    *slot = message.clone();
                    (Some(message), true)
                }
                None => (None, false),
            }
        })
        .await
    }

    async fn find_by_id(&self, project_id: &str, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self
            .read_all(project_id)
            .await?
            .into_iter()
            .find(|m| m.id == id))
    }

    async fn clear(&self, project_id: &str) -> StoreResult<()> {
        self.update(project_id, |messages| {
            messages.clear();
            ((), true)
        })
        .await
    }

    async fn modify(
        &self,
        project_id: &str,
        id: MessageId,
        edit: MessageEdit,
    ) -> StoreResult<Option<Message>> {
        self.update(project_id, |messages| {
            match messages.iter_mut().find(|m| m.id == id) {
                Some(slot) => {
                    edit(slot);
                    (Some(slot.clone()), true)
                }
                None => (None, false),
            }
        })
        .await
    }

    async fn retry(&self, project_id: &str, id: MessageId) -> StoreResult<RetryOutcome> {
        self.update(project_id, |messages| {
            let outcome = reset_for_retry(messages, id);
            let dirty = matches!(outcome, RetryOutcome::Reset { .. });
            (outcome, dirty)
        })
        .await
    }
}
