use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{Harness, Setup, wait_until};
use crate::core::config::{RetryPolicy, SchedulerConfig};
use crate::core::message::{Message, MessageDraft, MessageId, MessageStatus, RetryOutcome};
use crate::core::store::{
    ChatLog, JsonChatLog, MessageEdit, SharedChatLog, StoreError, StoreResult,
};

fn failing_script(dir: &std::path::Path) -> String {
    format!(
        "echo attempt >> '{}'; echo 'compiler exploded' >&2; exit 1",
        dir.join("attempts").display()
    )
}

#[tokio::test]
async fn manual_policy_records_error_reply() {
    let h = Harness::build(failing_script, Setup::default());
    let origin = h.post("p1", "developer", "build").await;

    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Error).await;
    h.settle().await;

    let messages = h.messages("p1").await;
    assert_eq!(messages.len(), 2);
    let error = &messages[1];
    assert_eq!(error.agent, "system");
    assert_eq!(error.in_reply_to, Some(origin.id));
    assert_eq!(
        error.content,
        "Error executing command: agent exited with code 1: compiler exploded"
    );

    // stays failed until a human retries
    for _ in 0..3 {
        assert_eq!(h.dispatcher.scan().await, 0);
    }
    assert_eq!(h.trace_lines("attempts"), 1);
}

#[tokio::test]
async fn human_retry_redispatches() {
    let h = Harness::build(failing_script, Setup::default());
    let origin = h.post("p1", "developer", "build").await;
    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Error).await;
    h.settle().await;

    let outcome = h.chat.retry("p1", origin.id).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Reset { deleted: 1 });
    h.dispatcher.ledger().release("p1", origin.id);

    assert_eq!(h.dispatcher.scan().await, 1);
    h.wait_status("p1", origin.id, MessageStatus::Error).await;
    h.settle().await;
    assert_eq!(h.trace_lines("attempts"), 2);
    assert_eq!(h.messages("p1").await.len(), 2);
}

#[tokio::test]
async fn automatic_policy_rearms_until_max_attempts() {
    let h = Harness::build(
        failing_script,
        Setup {
            scheduler: SchedulerConfig {
                retry_policy: RetryPolicy::Automatic,
                max_attempts: 3,
                ..SchedulerConfig::default()
            },
            ..Setup::default()
        },
    );
    let origin = h.post("p1", "developer", "build").await;

    wait_until("retries to run out", || async {
        h.dispatcher.scan().await;
        h.message("p1", origin.id).await.status == Some(MessageStatus::Error)
    })
    .await;
    h.settle().await;

    assert_eq!(h.trace_lines("attempts"), 3);
    assert_eq!(h.dispatcher.ledger().attempts("p1", origin.id), 3);
    let messages = h.messages("p1").await;
    // re-armed attempts leave no trace in the log, only the final failure does
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].agent, "system");
    assert_eq!(h.dispatcher.scan().await, 0);
}

#[tokio::test]
async fn timeout_is_recorded_as_failure() {
    let h = Harness::build(
        |_| "exec sleep 10".to_string(),
        Setup {
            timeout: Some(Duration::from_millis(200)),
            ..Setup::default()
        },
    );
    let origin = h.post("p1", "developer", "hang").await;

    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Error).await;
    let error = h.messages("p1").await.pop().unwrap();
    assert!(error.content.contains("timed out"), "{}", error.content);
}

#[tokio::test]
async fn one_failure_does_not_affect_other_dispatches() {
    let h = Harness::new("case \"$1\" in --agent=broken) exit 2 ;; *) echo fine ;; esac");
    let bad = h.post("p1", "broken", "will fail").await;
    let good = h.post("p1", "developer", "will work").await;

    assert_eq!(h.dispatcher.scan().await, 2);
    h.wait_status("p1", bad.id, MessageStatus::Error).await;
    h.wait_status("p1", good.id, MessageStatus::Completed).await;
    h.settle().await;

    let messages = h.messages("p1").await;
    let good_reply = messages
        .iter()
        .find(|m| m.in_reply_to == Some(good.id))
        .unwrap();
    assert_eq!(good_reply.content, "fine");
    let bad_reply = messages
        .iter()
        .find(|m| m.in_reply_to == Some(bad.id))
        .unwrap();
    assert!(bad_reply.content.contains("code 2"));
}

#[tokio::test]
async fn unusable_working_dir_is_an_error_reply() {
    let h = Harness::new("echo never");
    let missing = h.tmp.path().join("does-not-exist");
    std::fs::write(
        h.tmp.path().join("projects.json"),
        serde_json::json!({"projects": [{"id": "p3", "folder": missing}]}).to_string(),
    )
    .unwrap();
    let origin = h.post("p3", "developer", "go").await;

    assert_eq!(h.dispatcher.scan().await, 1);
    h.wait_status("p3", origin.id, MessageStatus::Error).await;
    let error = h.messages("p3").await.pop().unwrap();
    assert!(
        error
            .content
            .starts_with("Error executing command: failed to start `sh`"),
        "{}",
        error.content
    );
}

#[tokio::test]
async fn interrupted_messages_are_recovered_as_errors() {
    let h = Harness::new("echo never");
    let mut draft = MessageDraft::new("user", "was running", 0);
    draft.recipient = Some(crate::core::message::Recipient::One("developer".into()));
    draft.status = Some(MessageStatus::Processing);
    let stuck = h.chat.append("p1", draft).await.unwrap();

    assert_eq!(h.dispatcher.recover_interrupted().await, 1);
    let stuck = h.message("p1", stuck.id).await;
    assert_eq!(stuck.status, Some(MessageStatus::Error));
    let messages = h.messages("p1").await;
    assert_eq!(messages.len(), 2);
    assert!(messages[1].content.contains("interrupted"));
    assert_eq!(h.dispatcher.scan().await, 0);
}

#[tokio::test]
async fn reply_from_a_discarded_branch_is_dropped() {
    let h = Harness::new(
        r#"case "$1" in
--agent=developer) echo '{"response":"hand","for":"tester"}' ;;
*) sleep 0.6; echo late-from-discarded-branch ;;
esac"#,
    );
    let origin = h.post("p1", "developer", "build it").await;

    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Completed).await;
    h.settle().await;
    let forwarded = h.messages("p1").await[1].clone();
    assert_eq!(forwarded.status, Some(MessageStatus::Waiting));

    assert_eq!(h.dispatcher.scan().await, 1);
    h.wait_status("p1", forwarded.id, MessageStatus::Processing)
        .await;

    // the human rewinds to the origin while the tester is still running
    let outcome = h.chat.retry("p1", origin.id).await.unwrap();
    assert_eq!(outcome, RetryOutcome::Reset { deleted: 1 });
    h.dispatcher.ledger().release("p1", origin.id);
    h.settle().await;

    let messages = h.messages("p1").await;
    assert_eq!(messages.len(), 1, "{:?}", messages);
    assert_eq!(messages[0].status, Some(MessageStatus::Waiting));
    assert!(!h.dispatcher.ledger().contains("p1", forwarded.id));
}

#[tokio::test]
async fn failure_of_a_cleared_message_leaves_the_log_empty() {
    let h = Harness::new("sleep 0.4; exit 1");
    let origin = h.post("p1", "developer", "build it").await;

    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Processing).await;
    h.chat.clear("p1").await.unwrap();
    h.dispatcher.ledger().release_project("p1");
    h.settle().await;

    assert!(h.messages("p1").await.is_empty());
}

/// Chat log whose first agent reply write fails.
struct FailingFirstReply {
    inner: Arc<JsonChatLog>,
    failed: AtomicBool,
}

#[async_trait]
impl ChatLog for FailingFirstReply {
    async fn read_all(&self, project_id: &str) -> StoreResult<Vec<Message>> {
        self.inner.read_all(project_id).await
    }

    async fn append(&self, project_id: &str, draft: MessageDraft) -> StoreResult<Message> {
        self.inner.append(project_id, draft).await
    }

    async fn append_reply(
        &self,
        project_id: &str,
        draft: MessageDraft,
    ) -> StoreResult<Option<Message>> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::io(
                &self.inner.chat_file(project_id),
                std::io::Error::other("disk full"),
            ));
        }
        self.inner.append_reply(project_id, draft).await
    }

    async fn edit_in_place(
        &self,
        project_id: &str,
        message: Message,
    ) -> StoreResult<Option<Message>> {
        self.inner.edit_in_place(project_id, message).await
    }

    async fn find_by_id(&self, project_id: &str, id: MessageId) -> StoreResult<Option<Message>> {
        self.inner.find_by_id(project_id, id).await
    }

    async fn clear(&self, project_id: &str) -> StoreResult<()> {
        self.inner.clear(project_id).await
    }

    async fn modify(
        &self,
        project_id: &str,
        id: MessageId,
        edit: MessageEdit,
    ) -> StoreResult<Option<Message>> {
        self.inner.modify(project_id, id, edit).await
    }

    async fn retry(&self, project_id: &str, id: MessageId) -> StoreResult<RetryOutcome> {
        self.inner.retry(project_id, id).await
    }
}

fn failing_first_reply(inner: Arc<JsonChatLog>) -> SharedChatLog {
    Arc::new(FailingFirstReply {
        inner,
        failed: AtomicBool::new(false),
    })
}

#[tokio::test]
async fn unstorable_reply_becomes_an_error_reply() {
    let h = Harness::build(
        |_| "echo 'Fixed.'".to_string(),
        Setup {
            wrap_chat: Some(failing_first_reply),
            ..Setup::default()
        },
    );
    let origin = h.post("p1", "developer", "fix it").await;

    h.dispatcher.scan().await;
    h.wait_status("p1", origin.id, MessageStatus::Error).await;
    h.settle().await;

    let messages = h.messages("p1").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].agent, "system");
    assert_eq!(messages[1].in_reply_to, Some(origin.id));
    assert!(
        messages[1]
            .content
            .starts_with("Error executing command: could not record the agent outcome:"),
        "{}",
        messages[1].content
    );
    assert!(messages[1].content.contains("disk full"));
    assert!(!h.dispatcher.ledger().contains("p1", origin.id));
}
