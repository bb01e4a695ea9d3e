use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ledger::DispatchLedger;
use crate::core::block::current_block;
use crate::core::config::{OutputMode, RetryPolicy, SchedulerConfig};
use crate::core::interpreter::{Interpretation, ReplyAction, ReplyItem, SharedInterpreter};
use crate::core::invoker::{AgentInvoker, AgentOutput, InvocationError, InvokerEvent};
use crate::core::message::{
    Message, MessageDraft, MessageId, MessageStatus, Recipient, answered_ids, can_transition,
    needs_dispatch,
};
use crate::core::store::{Project, SharedChatLog, SharedProjects, StoreError, StoreResult};

/// Result of a trigger request for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted,
    AlreadyRunning,
    /// The message already finished; it has to be retried instead.
    AlreadyAnswered,
    ProjectNotFound,
    MessageNotFound,
}

/// Per-message handling: pickup, invocation, interpretation and reply production.
pub struct Dispatcher {
    chat: SharedChatLog,
    projects: SharedProjects,
    invoker: AgentInvoker,
    interpreter: SharedInterpreter,
    ledger: DispatchLedger,
    retry_policy: RetryPolicy,
    max_attempts: u32,
    in_flight: Arc<AtomicUsize>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dispatcher {
    pub fn new(
        chat: SharedChatLog,
        projects: SharedProjects,
        invoker: AgentInvoker,
        interpreter: SharedInterpreter,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            chat,
            projects,
            invoker,
            interpreter,
            ledger: DispatchLedger::new(),
            retry_policy: scheduler.retry_policy,
            max_attempts: scheduler.max_attempts.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ledger(&self) -> &DispatchLedger {
        &self.ledger
    }

    pub fn invoker(&self) -> &AgentInvoker {
        &self.invoker
    }

    pub fn interpreter(&self) -> &SharedInterpreter {
        &self.interpreter
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn user(&self) -> &str {
        &self.invoker.config().user
    }

    /// One pass over every active project. Eligible messages are claimed in
    /// the ledger and handed to their own task; returns how many were started.
    pub async fn scan(self: &Arc<Self>) -> usize {
        let projects = match self.projects.list_active().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!("Scheduler could not list projects: {}", e);
                return 0;
            }
        };

        let mut started = 0;
        for project in projects {
            let messages = match self.chat.read_all(&project.id).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Scheduler could not read chat of project {}: {}", project.id, e);
                    continue;
                }
            };
            let answered = answered_ids(&messages);

            for message in messages {
                if self.ledger.contains(&project.id, message.id)
                    || !needs_dispatch(&message, &answered, self.user())
                {
                    continue;
                }
                let Some(attempt) = self.ledger.try_claim(&project.id, message.id) else {
                    continue;
                };
                info!(
                    "Dispatching message {} of project {} to [{}] (attempt {})",
                    message.id,
                    project.id,
                    self.invoker.target_agent(&message),
                    attempt
                );
                self.spawn_handling(project.clone(), message);
                started += 1;
            }
        }
        started
    }

    /// Starts handling `id` on behalf of an external caller, unless it is
    /// already running.
    pub async fn trigger(self: &Arc<Self>, project_id: &str, id: MessageId) -> StoreResult<TriggerOutcome> {
        let Some(project) = self.projects.get(project_id).await? else {
            return Ok(TriggerOutcome::ProjectNotFound);
        };
        let Some(message) = self.chat.find_by_id(project_id, id).await? else {
            return Ok(TriggerOutcome::MessageNotFound);
        };
        if message.status.is_some_and(MessageStatus::is_terminal) {
            return Ok(TriggerOutcome::AlreadyAnswered);
        }
        if self.ledger.try_claim(project_id, id).is_none() {
            return Ok(TriggerOutcome::AlreadyRunning);
        }
        info!("Manual trigger for message {} of project {}", id, project_id);
        self.spawn_handling(project, message);
        Ok(TriggerOutcome::Accepted)
    }

    /// Marks messages left in `processing` by a previous run as failed, so a
    /// human can retry them. Returns how many were recovered.
    pub async fn recover_interrupted(&self) -> usize {
        let projects = match self.projects.list_all().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!("Could not list projects for recovery: {}", e);
                return 0;
            }
        };
        let mut recovered = 0;
        for project in projects {
            let Ok(messages) = self.chat.read_all(&project.id).await else {
                continue;
            };
            let answered = answered_ids(&messages);
            for message in messages {
                if message.status != Some(MessageStatus::Processing)
                    || self.ledger.contains(&project.id, message.id)
                {
                    continue;
                }
                warn!(
                    "Message {} of project {} was interrupted mid-dispatch",
                    message.id, project.id
                );
                let work_dir = self.projects.working_dir(&project);
                let result = async {
                    if !answered.contains(&message.id) {
                        self.append_error_reply(
                            &project.id,
                            &message,
                            &work_dir,
                            "dispatch interrupted by a restart",
                        )
                        .await?;
                    }
                    self.set_status(&project.id, message.id, MessageStatus::Error)
                        .await
                };
                match result.await {
                    Ok(_) => recovered += 1,
                    Err(e) => warn!("Could not recover message {}: {}", message.id, e),
                }
            }
        }
        recovered
    }

    pub fn spawn_handling(self: &Arc<Self>, project: Project, message: Message) -> JoinHandle<()> {
        let this = self.clone();
        let guard = InFlightGuard::enter(&self.in_flight);
        tokio::spawn(async move {
            let _guard = guard;
            let project_id = project.id.clone();
            let message_id = message.id;
            if let Err(e) = this.handle(project, message).await {
                error!(
                    "Dispatch of message {} in project {} aborted: {}",
                    message_id, project_id, e
                );
            }
        })
    }

    async fn handle(&self, project: Project, message: Message) -> StoreResult<()> {
        let work_dir = self.projects.working_dir(&project);

        let picked = match self.pick_up(&project.id, message.id).await {
            Ok(picked) => picked,
            Err(e) => {
                self.ledger.release_for_retry(&project.id, message.id);
                return Err(e);
            }
        };
        let Some(message) = picked else {
            debug!(
                "Message {} is gone or already finished, skipping it",
                message.id
            );
            self.ledger.release(&project.id, message.id);
            return Ok(());
        };

        let (progress, forwarder) = match self.invoker.config().output_mode {
            OutputMode::StreamJson => {
                let (tx, rx) = mpsc::channel(32);
                (Some(tx), Some(self.forward_thinking(&project.id, message.id, rx)))
            }
            OutputMode::Text => (None, None),
        };

        let result = self.invoker.run(&message, &work_dir, progress).await;
        if let Some(forwarder) = forwarder {
            forwarder.await;
        }

        let recorded = match result {
            Ok(output) => self.complete(&project.id, &message, &work_dir, output).await,
            Err(e) => self.handle_failure(&project.id, &message, &work_dir, e).await,
        };
        if let Err(e) = recorded {
            self.record_store_failure(&project.id, &message, &work_dir, &e)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Moves the stored message to `processing`. `None` when it was deleted or
    /// already reached a terminal status since it was read.
    async fn pick_up(&self, project_id: &str, id: MessageId) -> StoreResult<Option<Message>> {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let picked = self
            .chat
            .modify(
                project_id,
                id,
                Box::new(move |m: &mut Message| {
                    if m.status.is_some_and(MessageStatus::is_terminal) {
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    m.status = Some(MessageStatus::Processing);
                    m.thinking = None;
                }),
            )
            .await?;
        Ok(picked.filter(|_| !finished.load(Ordering::SeqCst)))
    }

    async fn complete(
        &self,
        project_id: &str,
        origin: &Message,
        work_dir: &Path,
        output: AgentOutput,
    ) -> StoreResult<()> {
        if !output.stderr.trim().is_empty() {
            debug!("Agent stderr for message {}: {}", origin.id, output.stderr.trim());
        }
        let interpretation = self.interpreter.interpret(&output.text).await;
        let kept = self
            .apply_interpretation(project_id, origin, work_dir, interpretation)
            .await?;
        if kept {
            self.set_status(project_id, origin.id, MessageStatus::Completed)
                .await?;
            info!("Message {} of project {} completed", origin.id, project_id);
        } else {
            info!(
                "Message {} of project {} was discarded while its agent ran, dropping the reply",
                origin.id, project_id
            );
        }
        // the log now records the outcome, answered messages are never picked up again
        self.ledger.release(project_id, origin.id);
        Ok(())
    }

    /// Best-effort error reply for a run whose outcome could not be stored.
    async fn record_store_failure(
        &self,
        project_id: &str,
        origin: &Message,
        work_dir: &Path,
        err: &StoreError,
    ) {
        let reason = format!("could not record the agent outcome: {}", err);
        if let Err(e) = self
            .append_error_reply(project_id, origin, work_dir, &reason)
            .await
        {
            warn!("Could not log the failure of message {}: {}", origin.id, e);
        }
        if let Err(e) = self
            .set_status(project_id, origin.id, MessageStatus::Error)
            .await
        {
            warn!("Could not mark message {} as failed: {}", origin.id, e);
        }
        self.ledger.release_for_retry(project_id, origin.id);
    }

    /// Writes thinking snapshots onto the message while it is still processing.
    fn forward_thinking(
        &self,
        project_id: &str,
        id: MessageId,
        mut rx: mpsc::Receiver<InvokerEvent>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let chat = self.chat.clone();
        let project_id = project_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let thinking = match event {
                    InvokerEvent::Thinking(text) => Some(text),
                    InvokerEvent::Finished => None,
                };
                let edit = Box::new(move |m: &mut Message| {
                    if m.status == Some(MessageStatus::Processing) {
                        m.thinking = thinking;
                    }
                });
                if let Err(e) = chat.modify(&project_id, id, edit).await {
                    debug!("Could not update thinking of message {}: {}", id, e);
                }
            }
        });
        async move {
            if let Err(e) = task.await {
                warn!("Thinking forwarder failed: {}", e);
            }
        }
    }

    async fn apply_interpretation(
        &self,
        project_id: &str,
        origin: &Message,
        work_dir: &Path,
        interpretation: Interpretation,
    ) -> StoreResult<bool> {
        let structured = matches!(interpretation, Interpretation::Structured { .. });
        for item in interpretation.into_items() {
            match item.action {
                ReplyAction::AskToUser => {
                    info!(
                        "Agent asked the user a question on message {}, chain paused",
                        origin.id
                    );
                    let question = Value::String(item.response.clone());
                    let asked = self
                        .chat
                        .modify(
                            project_id,
                            origin.id,
                            Box::new(move |m: &mut Message| {
                                if m.status == Some(MessageStatus::Processing) {
                                    m.set_metadata("pendingQuestion", question);
                                }
                            }),
                        )
                        .await?;
                    if asked.is_none_or(|m| m.status != Some(MessageStatus::Processing)) {
                        return Ok(false);
                    }
                }
                ReplyAction::Execute if !item.execution_order.is_empty() => {
                    let next = item.execution_order[0].clone();
                    let block_id = self.block_for(&item, work_dir);
                    let mut draft = self.reply_draft(origin, &item, block_id, structured);
                    draft.recipient = Some(Recipient::One(next.clone()));
                    draft.status = Some(MessageStatus::Waiting);
                    let Some(reply) = self.chat.append_reply(project_id, draft).await? else {
                        return Ok(false);
                    };
                    info!(
                        "Message {} hands off to [{}] as message {}",
                        origin.id, next, reply.id
                    );
                }
                ReplyAction::Execute | ReplyAction::Respond => {
                    if item.action == ReplyAction::Execute {
                        warn!(
                            "Execute action on message {} has no executionOrder, posting a plain reply",
                            origin.id
                        );
                    }
                    let block_id = self.block_for(&item, work_dir);
                    let mut draft = self.reply_draft(origin, &item, block_id, structured);
                    draft.recipient = item.recipient.clone();
                    if draft
                        .recipient
                        .as_ref()
                        .is_some_and(|r| r.primary() != Some(self.user()))
                    {
                        draft.status = Some(MessageStatus::Waiting);
                    }
                    if self.chat.append_reply(project_id, draft).await?.is_none() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn block_for(&self, item: &ReplyItem, work_dir: &Path) -> u64 {
        item.block_id.unwrap_or_else(|| current_block(work_dir))
    }

    fn reply_draft(
        &self,
        origin: &Message,
        item: &ReplyItem,
        block_id: u64,
        structured: bool,
    ) -> MessageDraft {
        let mut draft = MessageDraft::new(
            self.invoker.target_agent(origin),
            item.response.clone(),
            block_id,
        );
        draft.in_reply_to = Some(origin.id);
        if structured {
            let mut metadata = serde_json::Map::new();
            metadata.insert("extractedFor".into(), json!(item.recipient));
            metadata.insert("extractedBlockId".into(), json!(item.block_id));
            metadata.insert("extractedAction".into(), json!(item.action_tag));
            metadata.insert(
                "extractedExecutionOrder".into(),
                json!(item.execution_order),
            );
            metadata.insert("interpreter".into(), json!(self.interpreter.name()));
            draft.metadata = Some(metadata);
        }
        draft
    }

    async fn handle_failure(
        &self,
        project_id: &str,
        origin: &Message,
        work_dir: &Path,
        err: InvocationError,
    ) -> StoreResult<()> {
        let attempts = self.ledger.attempts(project_id, origin.id);
        if self.retry_policy == RetryPolicy::Automatic && attempts < self.max_attempts {
            warn!(
                "Message {} failed (attempt {}/{}), re-arming: {}",
                origin.id, attempts, self.max_attempts, err
            );
            self.set_status(project_id, origin.id, MessageStatus::Waiting)
                .await?;
            self.ledger.release_for_retry(project_id, origin.id);
            return Ok(());
        }

        error!("Message {} failed: {}", origin.id, err);
        if self
            .append_error_reply(project_id, origin, work_dir, &err.to_string())
            .await?
            .is_some()
        {
            self.set_status(project_id, origin.id, MessageStatus::Error)
                .await?;
        } else {
            info!(
                "Message {} was discarded while its agent ran, dropping the failure",
                origin.id
            );
        }
        self.ledger.release_for_retry(project_id, origin.id);
        Ok(())
    }

    async fn append_error_reply(
        &self,
        project_id: &str,
        origin: &Message,
        work_dir: &Path,
        reason: &str,
    ) -> StoreResult<Option<Message>> {
        let mut draft = MessageDraft::new(
            self.invoker.config().system_agent.clone(),
            format!("Error executing command: {}", reason),
            current_block(work_dir),
        );
        draft.in_reply_to = Some(origin.id);
        self.chat.append_reply(project_id, draft).await
    }

    async fn set_status(
        &self,
        project_id: &str,
        id: MessageId,
        status: MessageStatus,
    ) -> StoreResult<Option<Message>> {
        self.chat
            .modify(
                project_id,
                id,
                Box::new(move |m: &mut Message| {
                    if !can_transition(m.status, status) {
                        debug!(
                            "Message {} moves from {:?} to {}",
                            m.id,
                            m.status.map(MessageStatus::as_str),
                            status.as_str()
                        );
                    }
                    m.status = Some(status);
                    m.thinking = None;
                }),
            )
            .await
    }
}
