//! Heartbeat loop.
//!
//! Every tick sends one liveness message, retried a few times with a short
//! random pause. A tick that fails every attempt only asks the coordinator for
//! a reconnect; the loop itself keeps going and never redials.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::reconnect::HEARTBEAT_FAILED;
use super::StreamInner;
use crate::error::StreamError;
use crate::sfs::{unix_now, HeartbeatPayload, MessagingType};

impl StreamInner {
    pub(super) async fn run_heartbeat(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("heartbeat loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.is_reconnecting() {
                debug!("skipping heartbeat while reconnecting");
                continue;
            }
            let generation = self.upstream.generation().await;
            match self.send_heartbeat().await {
                Ok(()) => self.telemetry.on_heartbeat(true),
                Err(StreamError::Shutdown) => return,
                Err(err) => {
                    self.telemetry.on_heartbeat(false);
                    if self.is_reconnecting() {
                        debug!(error = %err, "heartbeat failed during recovery; not signalling");
                        continue;
                    }
                    warn!(
                        error = %err,
                        attempts = self.config.heartbeat_retries,
                        "heartbeat failed; requesting reconnect"
                    );
                    self.notifier.notify(HEARTBEAT_FAILED, generation);
                }
            }
        }
    }

    /// Sends one heartbeat, retrying up to the configured number of attempts.
    async fn send_heartbeat(&self) -> Result<(), StreamError> {
        let attempts = self.config.heartbeat_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.heartbeat_once().await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempt, "heartbeat succeeded after retry");
                    }
                    return Ok(());
                }
                Err(StreamError::Shutdown) => return Err(StreamError::Shutdown),
                Err(err) => {
                    debug!(attempt, error = %err, "heartbeat attempt failed");
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                let pause = self.config.heartbeat_backoff.jittered();
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(StreamError::Shutdown),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        Err(last_error.unwrap_or(StreamError::Shutdown))
    }

    async fn heartbeat_once(&self) -> Result<(), StreamError> {
        let payload = HeartbeatPayload {
            basic_data: self.identity.basic_data(),
            applications: self.identity.app_metas(&self.cursors()),
            heartbeat_time: unix_now(),
        };
        let payload = serde_json::to_vec(&payload)?;
        let timeout = self.config.heartbeat_timeout;
        match tokio::time::timeout(
            timeout,
            self.upstream
                .messaging(&self.shutdown, MessagingType::Heartbeat, payload),
        )
        .await
        {
            Ok(Err(StreamError::Cancelled)) => Err(StreamError::Shutdown),
            Ok(result) => result,
            Err(_) => Err(StreamError::rpc(
                "messaging",
                tonic::Status::deadline_exceeded(format!(
                    "heartbeat timed out after {timeout:?}"
                )),
            )),
        }
    }
}
