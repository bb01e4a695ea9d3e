//! `config.toml` settings. Every field has a default so a missing file (or a
//! partial one) is always a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";
pub const DATA_DIR_ENV: &str = "POCK_DATA_DIR";

/// Root data directory: `$POCK_DATA_DIR`, else `~/.pock`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pock")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PockConfig {
    pub log_level: LogLevel,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub interpreter: InterpreterConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// A failed message stays in `error` until a human retries it.
    #[default]
    Manual,
    /// A failed message is re-armed for the next tick until `max_attempts` is reached.
    Automatic,
}

impl RetryPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryPolicy::Manual => "manual",
            RetryPolicy::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub retry_policy: RetryPolicy,
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            retry_policy: RetryPolicy::Manual,
            max_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Whole stdout is the result.
    #[default]
    Text,
    /// Newline-delimited JSON events.
    StreamJson,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub output_mode: OutputMode,
    pub stream_args: Vec<String>,
    pub timeout_secs: u64,
    pub default_agent: String,
    pub coordinator: String,
    pub user: String,
    pub system_agent: String,
    pub agents_dir: Option<PathBuf>,
    pub fallback_agents: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--permission-mode=bypassPermissions".to_string(),
                "--tools=default".to_string(),
                "--allow-dangerously-skip-permissions".to_string(),
            ],
            output_mode: OutputMode::Text,
            stream_args: vec!["--output-format=stream-json".to_string(), "--verbose".to_string()],
            timeout_secs: 20 * 60,
            default_agent: "developer".to_string(),
            coordinator: "project-manager".to_string(),
            user: "user".to_string(),
            system_agent: "system".to_string(),
            agents_dir: None,
            fallback_agents: vec![
                "project-manager".to_string(),
                "lead-developer".to_string(),
                "developer".to_string(),
                "tester".to_string(),
            ],
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.agents_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("agents")
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterStrategy {
    #[default]
    Syntactic,
    Delegated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub strategy: InterpreterStrategy,
    pub normalizer_url: String,
    pub normalizer_model: String,
    pub normalizer_timeout_secs: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            strategy: InterpreterStrategy::Syntactic,
            normalizer_url: "http://localhost:11434".to_string(),
            normalizer_model: "erukude/omni-json:1b".to_string(),
            normalizer_timeout_secs: 60,
        }
    }
}

impl PockConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid config.toml")
    }

    /// Loads `<data_dir>/config.toml`, or the defaults when it does not exist.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text).with_context(|| format!("loading {:?}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {:?}", path)),
        }
    }
}
