//! The dispatch scheduler: a periodic scan of every active project that hands
//! eligible messages to the agent program and turns the output into replies.

mod dispatcher;
mod ledger;

#[cfg(test)]
mod tests;

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::lifecycle::LifecycleComponent;

pub use dispatcher::{Dispatcher, TriggerOutcome};
pub use ledger::DispatchLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub running: bool,
    pub claimed: usize,
    pub in_flight: usize,
    pub tick_ms: u64,
    pub retry_policy: &'static str,
}

/// Cloneable view of a scheduler for request handlers.
#[derive(Clone)]
pub struct SchedulerHandle {
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    tick: Duration,
}

impl SchedulerHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.running.load(Ordering::SeqCst),
            claimed: self.dispatcher.ledger().len(),
            in_flight: self.dispatcher.in_flight(),
            tick_ms: self.tick.as_millis() as u64,
            retry_policy: self.dispatcher.retry_policy().as_str(),
        }
    }
}

/// Owns the tick loop. Constructed once at start-up and driven through the
/// lifecycle manager.
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    tick: Duration,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, tick: Duration) -> Self {
        Self {
            dispatcher,
            tick,
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            dispatcher: self.dispatcher.clone(),
            running: self.running.clone(),
            tick: self.tick,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the tick loop. Calling it on a running scheduler is a no-op.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Scheduler already running");
            return;
        }
        self.cancel = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        let running = self.running.clone();
        let tick = self.tick;
        info!("Scheduler started (tick every {:?})", tick);

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        dispatcher.scan().await;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        }));
    }

    /// Stops scheduling new dispatches. Running agent tasks finish on their own.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Scheduler loop ended abnormally: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for Scheduler {
    fn name(&self) -> &'static str {
        "dispatch scheduler"
    }

    async fn on_init(&mut self) -> Result<()> {
        let recovered = self.dispatcher.recover_interrupted().await;
        if recovered > 0 {
            warn!("Marked {} interrupted message(s) as failed", recovered);
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        self.start();
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}
