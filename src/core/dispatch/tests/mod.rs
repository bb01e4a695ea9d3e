#![cfg(unix)]

mod failures;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use super::Dispatcher;
use crate::core::config::{AgentConfig, OutputMode, SchedulerConfig};
use crate::core::interpreter::SyntacticInterpreter;
use crate::core::invoker::AgentInvoker;
use crate::core::message::{Message, MessageDraft, MessageId, MessageStatus, Recipient};
use crate::core::store::{
    AgentDirectory, ChatLog, JsonChatLog, JsonProjectRegistry, SharedChatLog,
};

struct StaticAgents;

impl AgentDirectory for StaticAgents {
    fn list_agent_names(&self) -> Vec<String> {
        ["developer", "project-manager", "tester"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

/// A data dir with an active project `p1`, a paused project `p2`, and a
/// dispatcher whose agent program is `sh -c <script>`.
pub(super) struct Harness {
    pub tmp: TempDir,
    pub chat: Arc<JsonChatLog>,
    pub dispatcher: Arc<Dispatcher>,
}

pub(super) struct Setup {
    pub mode: OutputMode,
    pub scheduler: SchedulerConfig,
    pub timeout: Option<Duration>,
    /// Puts another log in front of the JSON one the harness reads back.
    pub wrap_chat: Option<fn(Arc<JsonChatLog>) -> SharedChatLog>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            mode: OutputMode::Text,
            scheduler: SchedulerConfig::default(),
            timeout: None,
            wrap_chat: None,
        }
    }
}

impl Harness {
    pub fn new(script: &str) -> Self {
        Self::build(|_| script.to_string(), Setup::default())
    }

    /// `script` receives the data dir, for scripts that leave traces there.
    pub fn build(script: impl FnOnce(&Path) -> String, setup: Setup) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("projects.json"),
            r#"{"projects":[{"id":"p1","title":"Active"},{"id":"p2","title":"Paused","paused":true}]}"#,
        )
        .unwrap();
        for id in ["p1", "p2"] {
            std::fs::create_dir_all(tmp.path().join("projects").join(id)).unwrap();
        }

        let agent = AgentConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script(tmp.path()), "agent".to_string()],
            output_mode: setup.mode,
            stream_args: Vec::new(),
            ..AgentConfig::default()
        };
        let mut invoker = AgentInvoker::new(agent, Arc::new(StaticAgents));
        if let Some(timeout) = setup.timeout {
            invoker = invoker.with_timeout(timeout);
        }

        let projects = Arc::new(JsonProjectRegistry::new(tmp.path()));
        let chat = Arc::new(JsonChatLog::new(projects.projects_dir()));
        let shared: SharedChatLog = match setup.wrap_chat {
            Some(wrap) => wrap(chat.clone()),
            None => chat.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            shared,
            projects,
            invoker,
            Arc::new(SyntacticInterpreter),
            &setup.scheduler,
        ));
        Self {
            tmp,
            chat,
            dispatcher,
        }
    }

    /// A human message addressed to `recipient`, already `waiting`.
    pub async fn post(&self, project: &str, recipient: &str, content: &str) -> Message {
        let mut draft = MessageDraft::new("user", content, 0);
        draft.recipient = Some(Recipient::One(recipient.to_string()));
        draft.status = Some(MessageStatus::Waiting);
        self.chat.append(project, draft).await.unwrap()
    }

    pub async fn messages(&self, project: &str) -> Vec<Message> {
        self.chat.read_all(project).await.unwrap()
    }

    pub async fn message(&self, project: &str, id: MessageId) -> Message {
        self.chat.find_by_id(project, id).await.unwrap().unwrap()
    }

    pub async fn wait_status(&self, project: &str, id: MessageId, status: MessageStatus) -> Message {
        wait_until(&format!("message {} to become {}", id, status.as_str()), || async {
            self.message(project, id).await.status == Some(status)
        })
        .await;
        self.message(project, id).await
    }

    /// Waits until no handling task is running any more.
    pub async fn settle(&self) {
        wait_until("dispatches to settle", || async {
            self.dispatcher.in_flight() == 0
        })
        .await;
    }

    pub fn trace_lines(&self, name: &str) -> usize {
        std::fs::read_to_string(self.tmp.path().join(name))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}

pub(super) async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
