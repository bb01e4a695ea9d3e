use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::PockConfig;
use crate::core::dispatch::{Dispatcher, Scheduler};
use crate::core::interpreter::{self, NormalizerClient};
use crate::core::invoker::AgentInvoker;
use crate::core::lifecycle::LifecycleManager;
use crate::core::store::{
    FsAgentDirectory, JsonChatLog, JsonProjectRegistry, SharedAgents, SharedChatLog,
    SharedProjects,
};
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging;

pub async fn run_serve(config: PockConfig, data_dir: PathBuf) -> Result<()> {
    let log_tx = logging::init(config.log_level);
    terminal::print_banner();

    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("creating data directory {:?}", data_dir))?;
    info!("Starting pock (data dir {:?})", data_dir);

    let registry = JsonProjectRegistry::new(&data_dir);
    let chat: SharedChatLog = Arc::new(JsonChatLog::new(registry.projects_dir()));
    let projects: SharedProjects = Arc::new(registry);
    let agents: SharedAgents = Arc::new(FsAgentDirectory::new(
        config.agent.agents_dir(),
        config.agent.fallback_agents.clone(),
    ));

    let invoker = AgentInvoker::new(config.agent.clone(), agents.clone());
    let interpreter = interpreter::from_config(&config.interpreter);
    info!(
        "Agent program `{}`, {} interpreter, {} retry policy",
        config.agent.program,
        interpreter.name(),
        config.scheduler.retry_policy.as_str()
    );

    let dispatcher = Arc::new(Dispatcher::new(
        chat.clone(),
        projects.clone(),
        invoker,
        interpreter,
        &config.scheduler,
    ));
    let scheduler = Scheduler::new(dispatcher, config.scheduler.tick());

    let api = ApiServer::new(ApiServerConfig {
        chat,
        projects,
        agents,
        scheduler: scheduler.handle(),
        normalizer: NormalizerClient::from_config(&config.interpreter),
        log_tx,
        api_host: config.server.host.clone(),
        api_port: config.server.port,
    });
    let api_url = format!("http://{}/api", api.address());

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(scheduler)));
    lifecycle.attach(Arc::new(Mutex::new(api)));
    lifecycle.start().await?;

    terminal::print_link("API", &api_url);
    terminal::print_status("Tick", &format!("{} ms", config.scheduler.tick_ms));
    terminal::print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down pock...");
    lifecycle.shutdown().await
}
