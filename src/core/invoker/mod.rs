//! Runs the external agent program for one dispatched message.

mod stream;

use serde::Serialize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::config::{AgentConfig, OutputMode};
use crate::core::message::Message;
use crate::core::store::SharedAgents;

pub use stream::{StreamAccumulator, StreamEvent, parse_event};

/// JSON object passed to the agent program as its single positional parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationParams {
    pub from: String,
    #[serde(rename = "blockId")]
    pub block_id: u64,
    pub context: String,
    #[serde(rename = "projectFolder")]
    pub project_folder: String,
    #[serde(rename = "attachedFiles", skip_serializing_if = "Vec::is_empty")]
    pub attached_files: Vec<String>,
    #[serde(rename = "available-agents", skip_serializing_if = "Option::is_none")]
    pub available_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub text: String,
    pub stderr: String,
}

/// Live progress of a running invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokerEvent {
    /// Everything the agent has produced so far.
    Thinking(String),
    /// The final result arrived; in-progress text can be discarded.
    Finished,
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent exited with {}: {}", exit_label(.code), failure_detail(.stderr, .stdout))]
    Exited {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("agent reported an error: {0}")]
    Reported(String),
    #[error("agent timed out after {}s", .0.as_secs_f32())]
    TimedOut(Duration),
    #[error("failed to read agent output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode invocation payload: {0}")]
    Payload(#[from] serde_json::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

fn failure_detail(primary: &str, secondary: &str) -> String {
    [primary.trim(), secondary.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("no output")
        .to_string()
}

pub struct AgentInvoker {
    config: AgentConfig,
    agents: SharedAgents,
    timeout: Duration,
}

impl AgentInvoker {
    pub fn new(config: AgentConfig, agents: SharedAgents) -> Self {
        let timeout = config.timeout();
        Self {
            config,
            agents,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// First recipient of the message, or the configured default agent.
    pub fn target_agent(&self, message: &Message) -> String {
        message
            .primary_recipient()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.config.default_agent)
            .to_string()
    }

    pub fn build_params(&self, message: &Message, target: &str, work_dir: &Path) -> InvocationParams {
        InvocationParams {
            from: message.agent.clone(),
            block_id: message.block_id,
            context: message.content.clone(),
            project_folder: work_dir.display().to_string(),
            attached_files: message.attached_files.clone(),
            available_agents: (target == self.config.coordinator)
                .then(|| self.agents.list_agent_names()),
        }
    }

    /// `<args…> [<stream_args…>] --agent=<target> -p <payload>`
    pub fn build_args(&self, target: &str, params: &InvocationParams) -> serde_json::Result<Vec<String>> {
        let mut args = self.config.args.clone();
        if self.config.output_mode == OutputMode::StreamJson {
            args.extend(self.config.stream_args.iter().cloned());
        }
        args.push(format!("--agent={}", target));
        args.push("-p".to_string());
        args.push(serde_json::to_string(params)?);
        Ok(args)
    }

    /// Runs the agent for `message` inside `work_dir`. Progress is reported on
    /// `progress` in stream mode.
    pub async fn run(
        &self,
        message: &Message,
        work_dir: &Path,
        progress: Option<mpsc::Sender<InvokerEvent>>,
    ) -> Result<AgentOutput, InvocationError> {
        let target = self.target_agent(message);
        let params = self.build_params(message, &target, work_dir);
        let args = self.build_args(&target, &params)?;

        info!(
            "Invoking agent [{}] for message {} in {:?}",
            target, message.id, work_dir
        );

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // the agent leads its own group so a timeout reaches its tool shells too
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|source| InvocationError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("agent stdout was not captured"))?;
        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe
                && let Err(e) = pipe.read_to_end(&mut buf).await
            {
                debug!("Agent stderr read failed: {}", e);
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mode = self.config.output_mode;
        let execution = async {
            let acc = match mode {
                OutputMode::Text => read_text(stdout).await?,
                OutputMode::StreamJson => read_stream(stdout, progress.as_ref()).await?,
            };
            let status = child.wait().await?;
            Ok::<(StreamAccumulator, ExitStatus), std::io::Error>((acc, status))
        };

        let outcome = tokio::time::timeout(self.timeout, execution).await;
        let (acc, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    "Agent [{}] exceeded {:?} on message {}, killing it",
                    target, self.timeout, message.id
                );
                kill_agent(&mut child).await;
                stderr_task.abort();
                return Err(InvocationError::TimedOut(self.timeout));
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(InvocationError::Exited {
                code: status.code(),
                stdout: acc.raw,
                stderr,
            });
        }
        if acc.reported_error() {
            return Err(InvocationError::Reported(failure_detail(
                &acc.final_text(),
                &stderr,
            )));
        }

        debug!(
            "Agent [{}] finished message {} ({} bytes of output)",
            target,
            message.id,
            acc.raw.len()
        );
        Ok(AgentOutput {
            text: acc.final_text().trim().to_string(),
            stderr,
        })
    }
}

/// SIGKILLs the agent's process group, then kills and reaps the agent itself.
async fn kill_agent(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id()
            && unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } != 0
        {
            debug!(
                "Could not signal process group {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill agent process: {}", e);
    }
}

async fn read_text(mut stdout: ChildStdout) -> std::io::Result<StreamAccumulator> {
    let mut buf = Vec::new();
    stdout.read_to_end(&mut buf).await?;
    Ok(StreamAccumulator {
        raw: String::from_utf8_lossy(&buf).into_owned(),
        ..Default::default()
    })
}

async fn read_stream(
    stdout: ChildStdout,
    progress: Option<&mpsc::Sender<InvokerEvent>>,
) -> std::io::Result<StreamAccumulator> {
    let mut acc = StreamAccumulator::default();
    let mut segments = BufReader::new(stdout).split(b'\n');

    while let Some(bytes) = segments.next_segment().await? {
        let text = String::from_utf8_lossy(&bytes);
        acc.raw.push_str(&text);
        acc.raw.push('\n');

        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        match parse_event(line) {
            Ok(Some(event)) => {
                let finished = matches!(event, StreamEvent::Result { .. });
                // Only the latest snapshot matters, so a full channel just skips one.
                if acc.apply(event)
                    && let Some(tx) = progress
                {
                    let _ = tx.try_send(InvokerEvent::Thinking(acc.thinking.clone()));
                }
                if finished && let Some(tx) = progress {
                    let _ = tx.send(InvokerEvent::Finished).await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Skipping non-event agent output ({}): {}", e, line),
        }
    }
    Ok(acc)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::message::{MessageDraft, Recipient};
    use crate::core::store::AgentDirectory;
    use std::sync::Arc;
    use std::time::Instant;

    struct StaticAgents(Vec<&'static str>);

    impl AgentDirectory for StaticAgents {
        fn list_agent_names(&self) -> Vec<String> {
            self.0.iter().map(|s| s.to_string()).collect()
        }
    }

    /// The agent program is `sh -c <script>`; the invocation arguments land in `$1..$3`.
    fn invoker(script: &str, mode: OutputMode) -> AgentInvoker {
        let config = AgentConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
            output_mode: mode,
            stream_args: Vec::new(),
            ..AgentConfig::default()
        };
        let agents = Arc::new(StaticAgents(vec!["developer", "project-manager", "tester"]));
        AgentInvoker::new(config, agents)
    }

    fn message(recipient: Option<&str>) -> Message {
        let mut draft = MessageDraft::new("user", "Fix the \"login\" bug `now`", 2);
        draft.recipient = recipient.map(|r| Recipient::One(r.to_string()));
        draft.into_message(1, "p1")
    }

    #[test]
    fn payload_lists_agents_only_for_coordinator() {
        let invoker = invoker("true", OutputMode::Text);
        let dir = Path::new("/work/p1");

        let dev = invoker.build_params(&message(Some("developer")), "developer", dir);
        assert!(dev.available_agents.is_none());
        let json = serde_json::to_value(&dev).unwrap();
        assert!(json.get("available-agents").is_none());
        assert!(json.get("attachedFiles").is_none());
        assert_eq!(json["blockId"], 2);
        assert_eq!(json["projectFolder"], "/work/p1");
        assert_eq!(json["from"], "user");

        let pm = invoker.build_params(&message(Some("project-manager")), "project-manager", dir);
        assert_eq!(
            pm.available_agents,
            Some(vec![
                "developer".to_string(),
                "project-manager".to_string(),
                "tester".to_string()
            ])
        );
    }

    #[test]
    fn target_defaults_when_recipient_missing() {
        let invoker = invoker("true", OutputMode::Text);
        assert_eq!(invoker.target_agent(&message(None)), "developer");
        assert_eq!(invoker.target_agent(&message(Some("tester"))), "tester");
        let mut many = message(None);
        many.recipient = Some(Recipient::Many(vec!["lead-developer".into(), "tester".into()]));
        assert_eq!(invoker.target_agent(&many), "lead-developer");
    }

    #[test]
    fn args_end_with_agent_and_payload() {
        let mut invoker = invoker("true", OutputMode::StreamJson);
        invoker.config.stream_args = vec!["--output-format=stream-json".into()];
        let params = invoker.build_params(&message(Some("tester")), "tester", Path::new("/w"));
        let args = invoker.build_args("tester", &params).unwrap();
        let n = args.len();
        assert_eq!(args[n - 4], "--output-format=stream-json");
        assert_eq!(args[n - 3], "--agent=tester");
        assert_eq!(args[n - 2], "-p");
        let payload: serde_json::Value = serde_json::from_str(&args[n - 1]).unwrap();
        assert_eq!(payload["context"], "Fix the \"login\" bug `now`");
    }

    #[tokio::test]
    async fn text_mode_returns_trimmed_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = invoker("echo 'Fixed.'; echo 'note' >&2", OutputMode::Text);
        let out = invoker
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap();
        assert_eq!(out.text, "Fixed.");
        assert_eq!(out.stderr.trim(), "note");
    }

    #[tokio::test]
    async fn payload_reaches_agent_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = invoker(r#"printf '%s|%s' "$1" "$3""#, OutputMode::Text);
        let out = invoker
            .run(&message(Some("project-manager")), tmp.path(), None)
            .await
            .unwrap();
        let (agent_flag, payload) = out.text.split_once('|').unwrap();
        assert_eq!(agent_flag, "--agent=project-manager");
        let payload: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(payload["context"], "Fix the \"login\" bug `now`");
        assert_eq!(payload["available-agents"][1], "project-manager");
    }

    #[tokio::test]
    async fn runs_in_project_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = invoker("pwd", OutputMode::Text);
        let out = invoker
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap();
        assert_eq!(
            Path::new(&out.text).canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn stream_mode_reports_thinking_and_prefers_result() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"
echo '{"type":"system","subtype":"init"}'
echo 'plain noise line'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Reading main.rs"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"Fixed."}'
"#;
        let invoker = invoker(script, OutputMode::StreamJson);
        let (tx, mut rx) = mpsc::channel(16);
        let out = invoker
            .run(&message(Some("developer")), tmp.path(), Some(tx))
            .await
            .unwrap();
        assert_eq!(out.text, "Fixed.");

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                InvokerEvent::Thinking("Reading main.rs".into()),
                InvokerEvent::Finished
            ]
        );
    }

    #[tokio::test]
    async fn stream_without_result_uses_accumulated_text() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Partial answer"}]}}'"#;
        let out = invoker(script, OutputMode::StreamJson)
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap();
        assert_eq!(out.text, "Partial answer");
    }

    #[tokio::test]
    async fn error_result_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"echo '{"type":"result","is_error":true,"result":"max turns reached"}'"#;
        let err = invoker(script, OutputMode::StreamJson)
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Reported(ref r) if r == "max turns reached"));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_output() {
        let tmp = tempfile::tempdir().unwrap();
        let err = invoker("echo partial; echo boom >&2; exit 3", OutputMode::Text)
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap_err();
        match &err {
            InvocationError::Exited {
                code,
                stdout,
                stderr,
            } => {
                assert_eq!(*code, Some(3));
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.to_string(), "agent exited with code 3: boom");
    }

    #[tokio::test]
    async fn timeout_kills_the_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker =
            invoker("exec sleep 30", OutputMode::Text).with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let err = invoker
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_also_kills_processes_the_agent_started() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("late-write");
        let script = format!("(sleep 1; echo late > '{}') & wait", marker.display());
        let err = invoker(&script, OutputMode::Text)
            .with_timeout(Duration::from_millis(300))
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "a subprocess outlived the timeout");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut invoker = invoker("true", OutputMode::Text);
        invoker.config.program = "/nonexistent/agent-program".into();
        let err = invoker
            .run(&message(Some("developer")), tmp.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
    }
}
