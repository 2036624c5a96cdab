use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{sync::watch, time};
use tracing::{error, info};

/// A periodic pass over persisted state. Runners drive passes on an interval
/// and, for processors that subscribe, on state changes.
#[async_trait]
pub trait ProcessorLogic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one pass and returns how many runs it acted on.
    async fn run_once(&self) -> Result<usize>;
}

pub struct ProcessorRunner<T: ProcessorLogic> {
    processor: Arc<T>,
    interval: Duration,
    change_rx: Option<watch::Receiver<()>>,
}

impl<T: ProcessorLogic> ProcessorRunner<T> {
    pub fn new(processor: Arc<T>, interval: Duration) -> Self {
        Self {
            processor,
            interval,
            change_rx: None,
        }
    }

    /// Also run a pass whenever the store signals a change.
    pub fn with_change_watcher(mut self, change_rx: watch::Receiver<()>) -> Self {
        self.change_rx = Some(change_rx);
        self
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        info!(processor = self.processor.name(), "starting processor");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut change_rx = self.change_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                Some(_) = changed(&mut change_rx) => {},
                _ = shutdown_rx.changed() => {
                    info!(processor = self.processor.name(), "processor shutting down");
                    break;
                }
            }
            if let Err(err) = self.processor.run_once().await {
                error!(processor = self.processor.name(), "error processing work: {:?}", err);
                // keep a failing store from spinning the loop
                time::sleep(self.interval).await;
            }
        }
    }
}

async fn changed(change_rx: &mut Option<watch::Receiver<()>>) -> Option<()> {
    match change_rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // sender dropped, fall back to the ticker only
                *change_rx = None;
                return None;
            }
            rx.borrow_and_update();
            Some(())
        }
        None => std::future::pending().await,
    }
}
