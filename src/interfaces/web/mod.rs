mod error;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::dispatch::SchedulerHandle;
use crate::core::interpreter::NormalizerClient;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::store::{SharedAgents, SharedChatLog, SharedProjects};

pub use router::build_api_router;

pub struct ApiServerConfig {
    pub chat: SharedChatLog,
    pub projects: SharedProjects,
    pub agents: SharedAgents,
    pub scheduler: SchedulerHandle,
    pub normalizer: NormalizerClient,
    pub log_tx: broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
}

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub(crate) chat: SharedChatLog,
    pub(crate) projects: SharedProjects,
    pub(crate) agents: SharedAgents,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) normalizer: Arc<NormalizerClient>,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) api_port: u16,
}

impl AppState {
    /// Name the human user writes under and is addressed by.
    pub(crate) fn user(&self) -> &str {
        &self.scheduler.dispatcher().invoker().config().user
    }
}

pub struct ApiServer {
    state: AppState,
    api_host: String,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            state: AppState {
                chat: config.chat,
                projects: config.projects,
                agents: config.agents,
                scheduler: config.scheduler,
                normalizer: Arc::new(config.normalizer),
                log_tx: config.log_tx,
                api_port: config.api_port,
            },
            api_host: config.api_host,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.api_host, self.state.api_port)
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "API server"
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = self.address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("API server could not bind {}", addr))?;
        let app = build_api_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        info!("API Server running at http://{}", addr);
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
