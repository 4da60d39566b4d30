//! Periodic forced reconnection.
//!
//! Sidecar fleets redistribute their long-lived connections by redialing on a
//! fixed interval. The scheduler runs at most once per client; enabling it
//! again only replaces the interval, which the loop reads before each sleep.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::UpstreamClient;
use crate::retry::RetryPolicy;

#[derive(Debug, Default)]
pub struct BounceScheduler {
    interval_ms: AtomicU64,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BounceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_interval(&self, interval: Duration) {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.interval_ms.store(millis.max(1), Ordering::Relaxed);
    }

    /// Stores `interval` and starts the loop unless it already runs.
    ///
    /// Returns `true` when this call started the loop.
    pub(super) fn enable(
        &self,
        interval: Duration,
        client: Weak<UpstreamClient>,
        shutdown: CancellationToken,
    ) -> bool {
        self.set_interval(interval);
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                interval_secs = interval.as_secs(),
                "bounce scheduler already running; updated interval only"
            );
            return false;
        }
        info!(interval_secs = interval.as_secs(), "bounce scheduler started");
        let handle = tokio::spawn(run(client, shutdown));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    pub(super) fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn run(client: Weak<UpstreamClient>, shutdown: CancellationToken) {
    loop {
        let Some(interval) = client.upgrade().map(|client| client.bounce.interval()) else {
            return;
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(client) = client.upgrade() else {
            return;
        };
        info!("bouncing upstream connection");
        client.telemetry.on_bounce(true);
        let mut policy = RetryPolicy::new(client.retry);
        loop {
            match client.reconnect().await {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        error = %err,
                        attempt = policy.attempts() + 1,
                        "scheduled bounce failed; retrying"
                    );
                    if policy.wait(&shutdown).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
