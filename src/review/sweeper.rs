//! Background task that periodically expires stale pending reviews.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::service::ReviewService;
use crate::errors::ReviewError;

struct SweeperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives [`ReviewService::sweep_expired`] on a fixed interval.
///
/// `start` is idempotent. `stop` signals the loop and waits for it, so a
/// sweep that is already running completes before `stop` returns.
pub struct ExpirySweeper {
    service: Arc<ReviewService>,
    interval: Duration,
    timeout: Duration,
    running: Mutex<Option<SweeperHandle>>,
}

impl ExpirySweeper {
    pub fn new(service: Arc<ReviewService>, interval: Duration, timeout: Duration) -> Self {
        Self {
            service,
            interval,
            timeout,
            running: Mutex::new(None),
        }
    }

    /// Build a sweeper from the service's own configuration.
    pub fn from_service(service: Arc<ReviewService>) -> Self {
        let interval = service.config().sweep_interval;
        let timeout = service.config().timeout;
        Self::new(service, interval, timeout)
    }

    fn handle(&self) -> MutexGuard<'_, Option<SweeperHandle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the sweep loop. Returns false if it was already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.handle();
        if running.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(
            Arc::clone(&self.service),
            self.interval,
            self.timeout,
            token.clone(),
        ));
        *running = Some(SweeperHandle { token, task });

        info!(
            interval_secs = self.interval.as_secs_f64(),
            timeout_secs = self.timeout.as_secs(),
            "Expiry sweeper started"
        );
        true
    }

    /// Stop the loop and wait for it to exit. Stopping a stopped sweeper is
    /// a no-op.
    pub async fn stop(&self) {
        let Some(handle) = self.handle().take() else {
            return;
        };
        handle.token.cancel();
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Expiry sweeper task ended abnormally");
        }
        info!("Expiry sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle()
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Run one sweep now, outside the schedule.
    pub async fn sweep_once(&self) -> Result<usize, ReviewError> {
        self.service.sweep_expired(Utc::now(), self.timeout).await
    }
}

impl std::fmt::Debug for ExpirySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirySweeper")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn sweep_loop(
    service: Arc<ReviewService>,
    period: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match service.sweep_expired(Utc::now(), timeout).await {
                    Ok(count) => debug!(count, "Sweep tick"),
                    Err(e) => warn!(error = %e, "Sweep failed; retrying next tick"),
                }
            }
        }
    }
}
