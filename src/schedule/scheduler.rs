//! Fixed-tick timer driving the disbursement executor

use super::executor::DisbursementExecutor;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Background loop calling [`DisbursementExecutor::run_tick`] every
/// `tick_interval`. The first tick runs immediately on start.
pub struct Scheduler {
    executor: Arc<DisbursementExecutor>,
    tick_interval: Duration,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(executor: Arc<DisbursementExecutor>) -> Self {
        let tick_interval = executor.config().tick_interval();
        Self::with_interval(executor, tick_interval)
    }

    pub fn with_interval(executor: Arc<DisbursementExecutor>, tick_interval: Duration) -> Self {
        Self {
            executor,
            tick_interval,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the timer loop. No-op if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let executor = Arc::clone(&self.executor);
        let shutdown = self.shutdown.clone();
        let period = self.tick_interval;

        info!(interval_secs = period.as_secs_f64(), "Starting allowance scheduler");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match executor.run_tick(Utc::now()).await {
                            Ok(report) if report.credited + report.failed + report.seeded > 0 => {
                                info!(?report, "Scheduler tick complete");
                            }
                            Ok(report) => debug!(?report, "Scheduler tick complete"),
                            Err(e) => error!("Scheduler tick failed: {:#}", e),
                        }
                    }
                }
            }
            debug!("Allowance scheduler stopped");
        }));
    }

    /// Cancel the loop and wait for an in-flight tick to finish
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
