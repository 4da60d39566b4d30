//! Telemetry hooks for the feed stream.
//!
//! Every background loop reports what it did through [`StreamTelemetry`]. The
//! trait methods default to no-ops so embedders only implement what they
//! export; [`CountingTelemetry`] keeps atomic counters that can be scraped into
//! any metric backend.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sfs::ReleaseChangeEvent;

/// Observer of stream lifecycle events.
pub trait StreamTelemetry: Send + Sync {
    /// Called after every dial attempt.
    fn on_dial(&self, _endpoint: &str, _success: bool) {}

    /// Called when a reconnect signal was accepted by the queue.
    fn on_reconnect_requested(&self, _reason: &str) {}

    /// Called when a reconnect signal was dropped because the queue was full.
    fn on_reconnect_dropped(&self, _reason: &str) {}

    /// Called when a recovery episode finished with a live watch.
    fn on_reconnect_complete(&self, _attempts: u32) {}

    /// Called once per heartbeat tick with its final outcome.
    fn on_heartbeat(&self, _success: bool) {}

    /// Called before a release event is handed to the application.
    fn on_release_event(&self, _event: &ReleaseChangeEvent) {}

    /// Called when a bounce happens; `scheduled` is false for server requests.
    fn on_bounce(&self, _scheduled: bool) {}
}

/// Telemetry sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl StreamTelemetry for NoopTelemetry {}

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    dial_success: AtomicU64,
    dial_failure: AtomicU64,
    reconnect_requested: AtomicU64,
    reconnect_dropped: AtomicU64,
    reconnect_complete: AtomicU64,
    heartbeat_success: AtomicU64,
    heartbeat_failure: AtomicU64,
    release_events: AtomicU64,
    scheduled_bounces: AtomicU64,
    server_bounces: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            dial_success: self.dial_success.load(Ordering::Relaxed),
            dial_failure: self.dial_failure.load(Ordering::Relaxed),
            reconnect_requested: self.reconnect_requested.load(Ordering::Relaxed),
            reconnect_dropped: self.reconnect_dropped.load(Ordering::Relaxed),
            reconnect_complete: self.reconnect_complete.load(Ordering::Relaxed),
            heartbeat_success: self.heartbeat_success.load(Ordering::Relaxed),
            heartbeat_failure: self.heartbeat_failure.load(Ordering::Relaxed),
            release_events: self.release_events.load(Ordering::Relaxed),
            scheduled_bounces: self.scheduled_bounces.load(Ordering::Relaxed),
            server_bounces: self.server_bounces.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub dial_success: u64,
    pub dial_failure: u64,
    pub reconnect_requested: u64,
    /// Signals dropped because a recovery was already pending.
    pub reconnect_dropped: u64,
    pub reconnect_complete: u64,
    pub heartbeat_success: u64,
    pub heartbeat_failure: u64,
    pub release_events: u64,
    pub scheduled_bounces: u64,
    pub server_bounces: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dial_success={}, dial_failure={}, reconnect_requested={}, reconnect_dropped={}, reconnect_complete={}, heartbeat_success={}, heartbeat_failure={}, release_events={}, scheduled_bounces={}, server_bounces={}",
            self.dial_success,
            self.dial_failure,
            self.reconnect_requested,
            self.reconnect_dropped,
            self.reconnect_complete,
            self.heartbeat_success,
            self.heartbeat_failure,
            self.release_events,
            self.scheduled_bounces,
            self.server_bounces
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every event.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl StreamTelemetry for CountingTelemetry {
    fn on_dial(&self, _endpoint: &str, success: bool) {
        let counter = if success {
            &self.counters.dial_success
        } else {
            &self.counters.dial_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_reconnect_requested(&self, _reason: &str) {
        self.counters
            .reconnect_requested
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_reconnect_dropped(&self, _reason: &str) {
        self.counters
            .reconnect_dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_reconnect_complete(&self, _attempts: u32) {
        self.counters
            .reconnect_complete
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_heartbeat(&self, success: bool) {
        let counter = if success {
            &self.counters.heartbeat_success
        } else {
            &self.counters.heartbeat_failure
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_release_event(&self, _event: &ReleaseChangeEvent) {
        self.counters.release_events.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bounce(&self, scheduled: bool) {
        let counter = if scheduled {
            &self.counters.scheduled_bounces
        } else {
            &self.counters.server_bounces
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn StreamTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a telemetry observer to the dispatcher.
    pub fn with_observer(mut self, telemetry: Arc<dyn StreamTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl StreamTelemetry for CompositeTelemetry {
    fn on_dial(&self, endpoint: &str, success: bool) {
        for observer in &self.observers {
            observer.on_dial(endpoint, success);
        }
    }

    fn on_reconnect_requested(&self, reason: &str) {
        for observer in &self.observers {
            observer.on_reconnect_requested(reason);
        }
    }

    fn on_reconnect_dropped(&self, reason: &str) {
        for observer in &self.observers {
            observer.on_reconnect_dropped(reason);
        }
    }

    fn on_reconnect_complete(&self, attempts: u32) {
        for observer in &self.observers {
            observer.on_reconnect_complete(attempts);
        }
    }

    fn on_heartbeat(&self, success: bool) {
        for observer in &self.observers {
            observer.on_heartbeat(success);
        }
    }

    fn on_release_event(&self, event: &ReleaseChangeEvent) {
        for observer in &self.observers {
            observer.on_release_event(event);
        }
    }

    fn on_bounce(&self, scheduled: bool) {
        for observer in &self.observers {
            observer.on_bounce(scheduled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfs::{Notification, CURRENT_API_VERSION};

    fn event() -> ReleaseChangeEvent {
        ReleaseChangeEvent {
            rid: "rid-1".into(),
            api_version: CURRENT_API_VERSION,
            notification: Notification::Unknown,
        }
    }

    #[test]
    fn counting_telemetry_tracks_all_events() {
        let telemetry = CountingTelemetry::default();
        telemetry.on_dial("a:1", true);
        telemetry.on_dial("a:1", false);
        telemetry.on_dial("b:1", false);
        telemetry.on_reconnect_requested("connection closed");
        telemetry.on_reconnect_dropped("connection closed");
        telemetry.on_reconnect_complete(2);
        telemetry.on_heartbeat(true);
        telemetry.on_heartbeat(false);
        telemetry.on_release_event(&event());
        telemetry.on_bounce(true);
        telemetry.on_bounce(false);

        let snapshot = telemetry.counters().snapshot();
        assert_eq!(
            snapshot,
            TelemetrySnapshot {
                dial_success: 1,
                dial_failure: 2,
                reconnect_requested: 1,
                reconnect_dropped: 1,
                reconnect_complete: 1,
                heartbeat_success: 1,
                heartbeat_failure: 1,
                release_events: 1,
                scheduled_bounces: 1,
                server_bounces: 1,
            }
        );
    }

    #[test]
    fn composite_telemetry_forwards_calls() {
        let primary = Arc::new(CountingTelemetry::default());
        let secondary = Arc::new(CountingTelemetry::default());
        let composite = CompositeTelemetry::new()
            .with_observer(primary.clone())
            .with_observer(secondary.clone())
            .with_observer(Arc::new(NoopTelemetry));

        composite.on_heartbeat(false);
        composite.on_release_event(&event());

        for snapshot in [primary.counters().snapshot(), secondary.counters().snapshot()] {
            assert_eq!(snapshot.heartbeat_failure, 1);
            assert_eq!(snapshot.release_events, 1);
        }
        assert!(format!("{composite:?}").contains("observer_count: 3"));
    }

    #[test]
    fn telemetry_snapshot_display_includes_all_fields() {
        let snapshot = TelemetrySnapshot {
            dial_failure: 4,
            server_bounces: 2,
            ..Default::default()
        };
        let formatted = snapshot.to_string();
        for segment in ["dial_success=0", "dial_failure=4", "server_bounces=2"] {
            assert!(
                formatted.contains(segment),
                "missing segment '{segment}' in '{formatted}'"
            );
        }
    }
}
