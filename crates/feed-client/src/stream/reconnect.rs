//! Reconnect coordinator.
//!
//! Background loops never redial themselves; they push a [`ReconnectSignal`]
//! into a small bounded queue. The coordinator drains that queue and runs at
//! most one recovery episode at a time: close the watch, redial until it
//! works, reopen the watch with the stored handler. Signals that arrive while
//! an episode is running are dropped.

use std::borrow::Cow;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::StreamInner;
use crate::error::StreamError;
use crate::retry::RetryPolicy;
use crate::telemetry::StreamTelemetry;

/// Raised by the heartbeat loop after every attempt of a tick failed.
pub const HEARTBEAT_FAILED: &str = "stream heartbeat failed";
/// Raised by the watch loop when the upstream asks the sidecar to move.
pub const BOUNCE_REQUESTED: &str = "received bounce request";
/// Raised by the watch loop when the stream ends without an error.
pub const CONNECTION_CLOSED: &str = "connection closed";
/// Raised by the watch loop when the stream fails with a transport error.
pub const WATCH_STREAM_CORRUPTED: &str = "watch stream corrupted";
/// Raised by the watch loop on a version mismatch when configured to reconnect.
pub const INCOMPATIBLE_VERSION: &str = "incompatible api version";
/// Raised through [`crate::FeedStream::notify_reconnect`] without a reason.
pub const MANUAL_REQUEST: &str = "manual reconnect request";

/// Request to re-establish connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSignal {
    pub reason: Cow<'static, str>,
    /// Connection generation the failure was observed on.
    pub generation: u64,
}

/// Non-blocking producer side of the signal queue.
#[derive(Clone)]
pub(crate) struct ReconnectNotifier {
    sender: mpsc::Sender<ReconnectSignal>,
    telemetry: Arc<dyn StreamTelemetry>,
}

impl ReconnectNotifier {
    pub(crate) fn new(
        sender: mpsc::Sender<ReconnectSignal>,
        telemetry: Arc<dyn StreamTelemetry>,
    ) -> Self {
        Self { sender, telemetry }
    }

    /// Queues a signal; drops it with a log line when the queue is full.
    pub(crate) fn notify(&self, reason: impl Into<Cow<'static, str>>, generation: u64) -> bool {
        let signal = ReconnectSignal {
            reason: reason.into(),
            generation,
        };
        match self.sender.try_send(signal) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(signal)) => {
                warn!(
                    reason = %signal.reason,
                    "reconnect queue full; dropping signal"
                );
                self.telemetry.on_reconnect_dropped(&signal.reason);
                false
            }
            Err(mpsc::error::TrySendError::Closed(signal)) => {
                debug!(reason = %signal.reason, "reconnect coordinator stopped; ignoring signal");
                false
            }
        }
    }
}

/// Recovery step retried by the coordinator.
#[derive(Debug, Clone, Copy)]
enum Step {
    Redial,
    Rewatch,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Self::Redial => "reconnect",
            Self::Rewatch => "start watch",
        }
    }
}

impl StreamInner {
    /// Drains the signal queue until shutdown, spawning one recovery per episode.
    pub(super) async fn run_coordinator(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<ReconnectSignal>,
    ) {
        loop {
            let signal = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("reconnect coordinator shutting down");
                    return;
                }
                signal = receiver.recv() => match signal {
                    Some(signal) => signal,
                    None => return,
                },
            };

            if self
                .reconnecting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!(reason = %signal.reason, "recovery already underway; ignoring signal");
                continue;
            }
            self.telemetry.on_reconnect_requested(&signal.reason);
            self.status.begin_reconnect(&signal.reason).await;
            info!(
                reason = %signal.reason,
                generation = signal.generation,
                "starting stream recovery"
            );
            tokio::spawn(self.clone().recover(signal));
        }
    }

    async fn recover(self: Arc<Self>, signal: ReconnectSignal) {
        match self.recover_episode(&signal).await {
            Ok(attempts) => {
                info!(reason = %signal.reason, attempts, "stream recovered");
                self.telemetry.on_reconnect_complete(attempts);
                self.status.end_reconnect(true).await;
            }
            Err(StreamError::Shutdown) => {
                debug!("stream recovery interrupted by shutdown");
                self.status.end_reconnect(false).await;
            }
            Err(err) => {
                error!(reason = %signal.reason, error = %err, "stream recovery abandoned");
                self.status.record_failure(err.to_string()).await;
                self.status.end_reconnect(false).await;
            }
        }
        self.reconnecting.store(false, Ordering::Release);
    }

    /// Returns the number of attempts the episode needed.
    async fn recover_episode(self: &Arc<Self>, signal: &ReconnectSignal) -> Result<u32, StreamError> {
        self.close_watch().await;

        let mut attempts = 0;
        let current = self.upstream.generation().await;
        if current > signal.generation {
            debug!(
                signal_generation = signal.generation,
                current_generation = current,
                "connection already replaced; skipping redial"
            );
        } else {
            attempts += self.retry_step(Step::Redial).await?;
        }

        if self.handler().is_some() {
            attempts += self.retry_step(Step::Rewatch).await?;
        } else {
            debug!("no watch handler registered; recovery stops after redial");
        }
        Ok(attempts)
    }

    async fn retry_step(self: &Arc<Self>, step: Step) -> Result<u32, StreamError> {
        let mut policy = RetryPolicy::new(self.config.reconnect_retry);
        loop {
            let result = match step {
                Step::Redial => self.upstream.reconnect().await,
                Step::Rewatch => match self.handler() {
                    Some(handler) => self.open_watch(handler).await,
                    None => return Ok(policy.attempts() + 1),
                },
            };
            let err = match result {
                Ok(()) => return Ok(policy.attempts() + 1),
                Err(StreamError::Shutdown | StreamError::Cancelled) => {
                    return Err(StreamError::Shutdown)
                }
                Err(err) => err,
            };

            let attempt = policy.attempts() + 1;
            if let Some(max) = self.config.max_recovery_attempts {
                if attempt >= max {
                    return Err(StreamError::RecoveryExhausted(max));
                }
            }
            warn!(step = step.as_str(), attempt, error = %err, "recovery step failed; retrying");
            self.status.record_failure(err.to_string()).await;
            policy.wait(&self.shutdown).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CountingTelemetry;

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let telemetry = CountingTelemetry::default();
        let (sender, _receiver) = mpsc::channel(5);
        let notifier = ReconnectNotifier::new(sender, Arc::new(telemetry.clone()));

        let accepted = (0..50)
            .filter(|_| notifier.notify(CONNECTION_CLOSED, 1))
            .count();
        assert_eq!(accepted, 5);
        assert_eq!(telemetry.counters().snapshot().reconnect_dropped, 45);
    }

    #[tokio::test]
    async fn closed_queue_is_ignored() {
        let (sender, receiver) = mpsc::channel(1);
        drop(receiver);
        let notifier = ReconnectNotifier::new(sender, Arc::new(CountingTelemetry::default()));
        assert!(!notifier.notify(HEARTBEAT_FAILED, 1));
    }

    #[test]
    fn signals_carry_owned_or_static_reasons() {
        let signal = ReconnectSignal {
            reason: format!("{BOUNCE_REQUESTED} from feed-2").into(),
            generation: 3,
        };
        assert!(signal.reason.starts_with(BOUNCE_REQUESTED));
    }
}
