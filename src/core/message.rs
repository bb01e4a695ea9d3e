//! Chat-log message model shared by the stores, the dispatch pipeline and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type MessageId = u64;

/// Recipient of a message: a single agent name or an ordered set of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    One(String),
    Many(Vec<String>),
}

impl Recipient {
    /// The agent that actually gets dispatched: the name itself, or the first
    /// entry of the list.
    pub fn primary(&self) -> Option<&str> {
        match self {
            Recipient::One(name) => Some(name.as_str()),
            Recipient::Many(names) => names.first().map(String::as_str),
        }
    }

    /// Whether the recipient is empty (`""` or `[]`), which is treated like no recipient.
    pub fn is_empty(&self) -> bool {
        self.primary().is_none_or(|name| name.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Waiting,
    Processing,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Waiting => "waiting",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Error)
    }
}

/// Allowed status transitions driven by the dispatch pipeline and the retry operation.
pub fn can_transition(from: Option<MessageStatus>, to: MessageStatus) -> bool {
    match (from, to) {
        (None, MessageStatus::Waiting | MessageStatus::Processing) => true,
        (Some(MessageStatus::Waiting), MessageStatus::Processing) => true,
        (Some(MessageStatus::Processing), MessageStatus::Completed | MessageStatus::Error) => true,
        // automatic retry re-arms a failed pickup
        (Some(MessageStatus::Processing), MessageStatus::Waiting) => true,
        // explicit human retry
        (Some(MessageStatus::Completed | MessageStatus::Error), MessageStatus::Waiting) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub agent: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub block_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "for", default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Message {
    pub fn primary_recipient(&self) -> Option<&str> {
        self.recipient.as_ref().and_then(Recipient::primary)
    }

    /// Inserts one metadata entry, creating the bag on first use.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value);
    }
}

/// A message that has not been stored yet. The chat log assigns `id` and
/// `timestamp` when appending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageDraft {
    pub agent: String,
    pub content: String,
    pub block_id: u64,
    pub recipient: Option<Recipient>,
    pub status: Option<MessageStatus>,
    pub in_reply_to: Option<MessageId>,
    pub attached_files: Vec<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl MessageDraft {
    pub fn new(agent: impl Into<String>, content: impl Into<String>, block_id: u64) -> Self {
        Self {
            agent: agent.into(),
            content: content.into(),
            block_id,
            ..Default::default()
        }
    }

    pub fn into_message(self, id: MessageId, project_id: &str) -> Message {
        Message {
            id,
            agent: self.agent,
            content: self.content,
            project_id: Some(project_id.to_string()),
            block_id: self.block_id,
            timestamp: Utc::now(),
            recipient: self.recipient,
            status: self.status,
            thinking: None,
            in_reply_to: self.in_reply_to,
            attached_files: self.attached_files,
            metadata: self.metadata,
        }
    }
}

/// Ids of every message that already has an answer in `messages`.
pub fn answered_ids(messages: &[Message]) -> HashSet<MessageId> {
    messages.iter().filter_map(|m| m.in_reply_to).collect()
}

/// Dispatch eligibility: addressed to someone other than the human user, not
/// already picked up, and not answered by any message in the log.
pub fn needs_dispatch(message: &Message, answered: &HashSet<MessageId>, user: &str) -> bool {
    let Some(recipient) = message.recipient.as_ref() else {
        return false;
    };
    if recipient.is_empty() || recipient.primary() == Some(user) {
        return false;
    }
    if matches!(
        message.status,
        Some(MessageStatus::Processing | MessageStatus::Completed | MessageStatus::Error)
    ) {
        return false;
    }
    !answered.contains(&message.id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    NotFound,
    NotTerminal(Option<MessageStatus>),
    Reset { deleted: usize },
}

/// Re-arms a terminal message for dispatch and drops everything logged after it.
pub fn reset_for_retry(messages: &mut Vec<Message>, id: MessageId) -> RetryOutcome {
    let Some(index) = messages.iter().position(|m| m.id == id) else {
        return RetryOutcome::NotFound;
    };
    let status = messages[index].status;
    if !status.is_some_and(MessageStatus::is_terminal) {
        return RetryOutcome::NotTerminal(status);
    }

    let deleted = messages.len() - index - 1;
    messages.truncate(index + 1);

    let message = &mut messages[index];
    message.status = Some(MessageStatus::Waiting);
    message.thinking = None;
    message.in_reply_to = None;

    RetryOutcome::Reset { deleted }
}
