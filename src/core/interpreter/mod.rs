//! Turns raw agent output into structured reply items.
//!
//! Two interchangeable strategies implement [`OutputInterpreter`]: in-process
//! syntactic extraction with JSON repair, and delegation to a secondary
//! normalization service that falls back to the syntactic path.

mod delegated;
mod syntactic;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::core::config::{InterpreterConfig, InterpreterStrategy};
use crate::core::message::Recipient;

pub use delegated::{DelegatedInterpreter, NormalizerClient};
pub use syntactic::{SyntacticInterpreter, find_json_candidate, parse_lenient};

/// What an agent asked the pipeline to do with its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyAction {
    /// Hand the work to the next agent of `execution_order`.
    Execute,
    /// Stop the chain until a human answers.
    AskToUser,
    /// Ordinary reply, including unknown action tags.
    Respond,
}

impl ReplyAction {
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(|t| t.trim().to_ascii_lowercase()).as_deref() {
            Some("execute") => ReplyAction::Execute,
            Some("ask-to-user") | Some("ask_to_user") => ReplyAction::AskToUser,
            _ => ReplyAction::Respond,
        }
    }
}

/// One reply-production step extracted from agent output.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyItem {
    pub response: String,
    pub recipient: Option<Recipient>,
    pub block_id: Option<u64>,
    pub action: ReplyAction,
    /// The action tag exactly as the agent wrote it.
    pub action_tag: Option<String>,
    pub execution_order: Vec<String>,
}

impl ReplyItem {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            response: text.into(),
            recipient: None,
            block_id: None,
            action: ReplyAction::Respond,
            action_tag: None,
            execution_order: Vec::new(),
        }
    }

    /// Reads the reply fields of one parsed value. `raw` is the response used
    /// when the object names none of `response`, `content` or `message`.
    pub fn from_value(value: &Value, raw: &str) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::plain(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        };

        let response = ["response", "content", "message"]
            .iter()
            .filter_map(|key| obj.get(*key))
            .find_map(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Null | Value::String(_) => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| raw.to_string());

        let recipient = obj
            .get("for")
            .and_then(|v| serde_json::from_value::<Recipient>(v.clone()).ok())
            .filter(|r| !r.is_empty());

        let block_id = obj.get("blockId").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        let action_tag = obj
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);

        let execution_order = match obj.get("executionOrder") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
            _ => Vec::new(),
        };

        Self {
            response,
            recipient,
            block_id,
            action: ReplyAction::from_tag(action_tag.as_deref()),
            action_tag,
            execution_order,
        }
    }
}

/// Result of interpreting one agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// Structured output was found; `json` is the parsed value itself.
    Structured { items: Vec<ReplyItem>, json: Value },
    /// Nothing structured: the whole text is the reply.
    PlainText(String),
}

impl Interpretation {
    /// Builds the structured outcome from a parsed value; arrays yield one item per element.
    pub fn from_json(json: Value, raw: &str) -> Self {
        let items = match &json {
            Value::Array(elements) => elements
                .iter()
                .map(|e| ReplyItem::from_value(e, raw))
                .collect(),
            other => vec![ReplyItem::from_value(other, raw)],
        };
        Interpretation::Structured { items, json }
    }

    /// Reply items in production order. Plain text becomes a single ordinary item.
    pub fn into_items(self) -> Vec<ReplyItem> {
        match self {
            Interpretation::Structured { items, .. } => items,
            Interpretation::PlainText(text) => vec![ReplyItem::plain(text)],
        }
    }
}

#[async_trait]
pub trait OutputInterpreter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn interpret(&self, raw: &str) -> Interpretation;
}

pub type SharedInterpreter = Arc<dyn OutputInterpreter>;

/// Builds the strategy selected in configuration.
pub fn from_config(config: &InterpreterConfig) -> SharedInterpreter {
    match config.strategy {
        InterpreterStrategy::Syntactic => Arc::new(SyntacticInterpreter),
        InterpreterStrategy::Delegated => {
            Arc::new(DelegatedInterpreter::new(NormalizerClient::from_config(config)))
        }
    }
}
