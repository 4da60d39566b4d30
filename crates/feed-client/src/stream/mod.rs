//! Stream orchestrator.
//!
//! [`FeedStream`] is the composition root: it dials, performs the handshake,
//! checks the upstream's protocol version, enables the bounce scheduler with
//! the server-assigned interval, and starts the reconnect coordinator and the
//! heartbeat loop. The owner calls [`FeedStream::start_watch`] once it is ready
//! to process release events.

mod heartbeat;
pub mod reconnect;
mod watch;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::reconnect::{ReconnectNotifier, MANUAL_REQUEST};
use self::watch::WatchSession;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::sfs::{
    is_api_version_match, ApiVersion, HandshakePayload, MessagingType, OfflinePayload,
    ReleaseChangeEvent, ReleaseChangeStatus, ResumeCursor, SideWatchPayload, SidecarIdentity,
    VersionChangePayload,
};
use crate::status::StreamStatus;
use crate::telemetry::{NoopTelemetry, StreamTelemetry};
use crate::upstream::transport::{Dialer, EndpointPicker};
use crate::upstream::{UpstreamClient, UpstreamOptions};

/// Application callback for release events.
///
/// Invoked from the watch receive loop; a slow handler stalls delivery of
/// later events. Failures are the handler's own business.
#[async_trait]
pub trait ReleaseChangeHandler: Send + Sync {
    async fn on_release_change(&self, event: &ReleaseChangeEvent);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the stream's background tasks.
pub(crate) struct StreamInner {
    config: StreamConfig,
    identity: Arc<SidecarIdentity>,
    upstream: Arc<UpstreamClient>,
    handshake: HandshakePayload,
    cursors: Mutex<HashMap<String, ResumeCursor>>,
    handler: Mutex<Option<Arc<dyn ReleaseChangeHandler>>>,
    watch: Mutex<Option<WatchSession>>,
    notifier: ReconnectNotifier,
    /// Set for the duration of a recovery episode.
    reconnecting: AtomicBool,
    telemetry: Arc<dyn StreamTelemetry>,
    status: Arc<StreamStatus>,
    shutdown: CancellationToken,
}

impl StreamInner {
    fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire) || self.upstream.is_reconnecting()
    }

    fn handler(&self) -> Option<Arc<dyn ReleaseChangeHandler>> {
        lock(&self.handler).clone()
    }

    fn replace_watch(&self, session: Option<WatchSession>) -> Option<WatchSession> {
        std::mem::replace(&mut *lock(&self.watch), session)
    }

    fn cursors(&self) -> HashMap<String, ResumeCursor> {
        lock(&self.cursors).clone()
    }

    fn record_cursor(&self, app: &str, cursor: ResumeCursor) {
        lock(&self.cursors).insert(app.to_string(), cursor);
    }

    fn watch_payload(&self) -> SideWatchPayload {
        SideWatchPayload {
            biz_id: self.identity.biz_id,
            applications: self.identity.app_metas(&self.cursors()),
        }
    }
}

/// Builder for [`FeedStream`].
pub struct FeedStreamBuilder {
    identity: SidecarIdentity,
    dialer: Arc<dyn Dialer>,
    picker: Arc<dyn EndpointPicker>,
    config: StreamConfig,
    telemetry: Arc<dyn StreamTelemetry>,
}

impl FeedStreamBuilder {
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn StreamTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Dials, handshakes, and starts the background loops.
    ///
    /// Fails when the first dial, the handshake, or the version check fails;
    /// nothing keeps running in that case.
    pub async fn connect(self) -> Result<FeedStream, StreamError> {
        let config = self.config.sanitise();
        let identity = Arc::new(self.identity);
        let shutdown = CancellationToken::new();
        let status = StreamStatus::new();

        let upstream = UpstreamClient::connect(
            identity.clone(),
            self.dialer,
            self.picker,
            UpstreamOptions {
                dial_timeout: config.dial_timeout,
                retry: config.reconnect_retry,
                telemetry: self.telemetry.clone(),
                status: status.clone(),
                shutdown: shutdown.child_token(),
            },
        )
        .await?;

        let handshake = match perform_handshake(&upstream, &shutdown).await {
            Ok(handshake) => handshake,
            Err(err) => {
                upstream.shutdown().await;
                return Err(err);
            }
        };
        info!(
            service = %handshake.service_info.name,
            ip = %handshake.service_info.ip,
            "handshake with upstream completed"
        );
        let bounce_interval = handshake
            .runtime_option
            .bounce_interval(config.default_bounce_interval);
        upstream.enable_bounce(bounce_interval);

        let (sender, receiver) = mpsc::channel(config.reconnect_queue_capacity);
        let inner = Arc::new(StreamInner {
            notifier: ReconnectNotifier::new(sender, self.telemetry.clone()),
            config,
            identity,
            upstream,
            handshake,
            cursors: Mutex::new(HashMap::new()),
            handler: Mutex::new(None),
            watch: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            telemetry: self.telemetry,
            status,
            shutdown,
        });

        let tasks = vec![
            tokio::spawn(inner.clone().run_coordinator(receiver)),
            tokio::spawn(inner.clone().run_heartbeat()),
        ];
        Ok(FeedStream {
            inner,
            tasks: Mutex::new(tasks),
        })
    }
}

async fn perform_handshake(
    upstream: &UpstreamClient,
    cancel: &CancellationToken,
) -> Result<HandshakePayload, StreamError> {
    let response = upstream.handshake(cancel).await?;
    let version = response
        .api_version
        .as_ref()
        .map(ApiVersion::from)
        .ok_or(StreamError::MissingVersion)?;
    if !is_api_version_match(&version) {
        return Err(StreamError::IncompatibleVersion(version));
    }
    HandshakePayload::decode(&response.payload)
}

/// Resilient client of the upstream feed service.
pub struct FeedStream {
    inner: Arc<StreamInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FeedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStream")
            .field("biz_id", &self.inner.identity.biz_id)
            .field("reconnecting", &self.inner.is_reconnecting())
            .field("tasks", &lock(&self.tasks).len())
            .finish()
    }
}

impl FeedStream {
    pub fn builder(
        identity: SidecarIdentity,
        dialer: Arc<dyn Dialer>,
        picker: Arc<dyn EndpointPicker>,
    ) -> FeedStreamBuilder {
        FeedStreamBuilder {
            identity,
            dialer,
            picker,
            config: StreamConfig::default(),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Connects with the default configuration and no telemetry.
    pub async fn connect(
        identity: SidecarIdentity,
        dialer: Arc<dyn Dialer>,
        picker: Arc<dyn EndpointPicker>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        Self::builder(identity, dialer, picker)
            .config(config)
            .connect()
            .await
    }

    pub fn identity(&self) -> &SidecarIdentity {
        &self.inner.identity
    }

    /// Details returned by the startup handshake.
    pub fn handshake_payload(&self) -> &HandshakePayload {
        &self.inner.handshake
    }

    pub fn status(&self) -> Arc<StreamStatus> {
        self.inner.status.clone()
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.inner.upstream
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.is_reconnecting()
    }

    /// Opens the watch and keeps `handler` for every rebuilt watch.
    ///
    /// An already open watch is closed first. Errors are returned to the caller;
    /// nothing is retried.
    pub async fn start_watch(&self, handler: Arc<dyn ReleaseChangeHandler>) -> Result<(), StreamError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StreamError::Shutdown);
        }
        *lock(&self.inner.handler) = Some(handler.clone());
        self.inner.close_watch().await;
        self.inner.open_watch(handler).await
    }

    /// Stops the receive loop. Recovery reopens it with the stored handler.
    pub async fn close_watch(&self) {
        self.inner.close_watch().await;
    }

    /// Asks the coordinator to re-establish connectivity; never blocks.
    ///
    /// Returns `false` when the signal was dropped because the queue is full.
    pub async fn notify_reconnect(&self, reason: Option<Cow<'static, str>>) -> bool {
        let generation = self.inner.upstream.generation().await;
        self.inner
            .notifier
            .notify(reason.unwrap_or(Cow::Borrowed(MANUAL_REQUEST)), generation)
    }

    /// Re-runs the handshake on the current connection.
    pub async fn handshake(&self) -> Result<HandshakePayload, StreamError> {
        perform_handshake(&self.inner.upstream, &self.inner.shutdown).await
    }

    /// Sends a raw messaging call; waits for any reconnect in flight.
    pub async fn messaging(&self, kind: MessagingType, payload: Vec<u8>) -> Result<(), StreamError> {
        self.inner
            .upstream
            .messaging(&self.inner.shutdown, kind, payload)
            .await
    }

    /// Resume cursor currently recorded for `app`.
    pub fn current_release(&self, app: &str) -> Option<ResumeCursor> {
        lock(&self.inner.cursors).get(app).copied()
    }

    /// Records what the owner actually applied; later watches resume from it.
    pub fn set_current_release(
        &self,
        app: &str,
        release_id: u32,
        cursor_id: u32,
    ) -> Result<(), StreamError> {
        if self.inner.identity.find_app(app).is_none() {
            return Err(StreamError::UnknownApp(app.to_string()));
        }
        self.inner
            .record_cursor(app, ResumeCursor::new(release_id, cursor_id));
        Ok(())
    }

    /// Reports the outcome of applying the app's current release.
    pub async fn report_version_change(
        &self,
        app: &str,
        status: ReleaseChangeStatus,
        reason: Option<String>,
    ) -> Result<(), StreamError> {
        let identity = &self.inner.identity;
        let entry = identity
            .find_app(app)
            .ok_or_else(|| StreamError::UnknownApp(app.to_string()))?;
        let cursor = self.current_release(app).unwrap_or_default();
        let payload = VersionChangePayload {
            basic_data: identity.basic_data(),
            application: identity.app_meta(entry, cursor),
            status,
            reason,
        };
        self.messaging(MessagingType::VersionChange, serde_json::to_vec(&payload)?)
            .await
    }

    /// Stops every background task and closes the connection.
    ///
    /// Sends a best-effort offline notice first.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.send_offline().await;
        self.inner.close_watch().await;
        self.inner.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in tasks {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.upstream.shutdown().await;
        info!("feed stream shut down");
    }

    async fn send_offline(&self) {
        let payload = OfflinePayload {
            basic_data: self.inner.identity.basic_data(),
        };
        let payload = match serde_json::to_vec(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "cannot encode offline notice");
                return;
            }
        };
        let timeout = self.inner.config.heartbeat_timeout;
        match tokio::time::timeout(
            timeout,
            self.messaging(MessagingType::SidecarOffline, payload),
        )
        .await
        {
            Ok(Ok(())) => debug!("offline notice sent"),
            Ok(Err(err)) => warn!(error = %err, "failed to send offline notice"),
            Err(_) => warn!("offline notice timed out after {timeout:?}"),
        }
    }
}

impl Drop for FeedStream {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionMismatchPolicy;
    use crate::proto::FeedWatchMessage;
    use crate::retry::{BackoffWindow, RetryConfig};
    use crate::sfs::{FeedMessageType, Notification, CURRENT_API_VERSION};
    use crate::telemetry::CountingTelemetry;
    use crate::test_support::{eventually, feed_message, ScriptedUpstream};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ReleaseChangeEvent>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            lock(&self.events).len()
        }
    }

    #[async_trait]
    impl ReleaseChangeHandler for Recorder {
        async fn on_release_change(&self, event: &ReleaseChangeEvent) {
            lock(&self.events).push(event.clone());
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_backoff: BackoffWindow::from_millis(1, 5),
            reconnect_retry: RetryConfig {
                immediate_retries: 5,
                window: BackoffWindow::from_millis(5, 20),
            },
            ..Default::default()
        }
    }

    async fn connect(upstream: &ScriptedUpstream, config: StreamConfig) -> FeedStream {
        FeedStream::builder(
            SidecarIdentity::new(7, ["gateway", "billing"]),
            upstream.dialer(),
            upstream.picker(),
        )
        .config(config)
        .connect()
        .await
        .expect("stream connects")
    }

    fn push(app: &str, release_id: u32, cursor_id: u32) -> FeedWatchMessage {
        feed_message(
            FeedMessageType::PublishRelease,
            json!({"kind": "push", "app": app, "releaseID": release_id, "cursorID": cursor_id}),
        )
    }

    #[tokio::test]
    async fn incompatible_handshake_aborts_startup() {
        let upstream = ScriptedUpstream::new();
        upstream.set_handshake(
            ApiVersion {
                major: 2,
                minor: 0,
                patch: 0,
            },
            "",
        );
        let result = FeedStream::connect(
            SidecarIdentity::new(7, ["gateway"]),
            upstream.dialer(),
            upstream.picker(),
            fast_config(),
        )
        .await;
        assert!(matches!(result, Err(StreamError::IncompatibleVersion(v)) if v.major == 2));
        assert_eq!(upstream.close_count(), 1, "connection released on failure");
    }

    #[tokio::test]
    async fn handshake_payload_drives_bounce_interval() {
        let upstream = ScriptedUpstream::new();
        upstream.set_handshake(
            CURRENT_API_VERSION,
            r#"{"serviceInfo":{"name":"feed","ip":"10.0.0.9"},"runtimeOption":{"bounceIntervalHour":2}}"#,
        );
        let stream = connect(&upstream, fast_config()).await;
        assert_eq!(stream.handshake_payload().service_info.ip, "10.0.0.9");
        assert_eq!(
            stream.upstream().bounce_interval(),
            Duration::from_secs(2 * 3600)
        );
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn release_events_reach_the_handler_and_advance_cursors() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(&upstream, fast_config()).await;
        let recorder = Arc::new(Recorder::default());
        stream.start_watch(recorder.clone()).await.expect("watch");

        assert!(upstream.push(push("gateway", 4, 40)));
        assert!(upstream.push(feed_message(FeedMessageType::Unknown(42), json!({}))));
        assert!(upstream.push(feed_message(
            FeedMessageType::PublishRelease,
            json!({"kind": "reload", "app": "billing", "releaseID": 2, "cursorID": 21, "reason": "drift"}),
        )));

        assert!(
            eventually(Duration::from_secs(2), || {
                recorder.count() == 2 && stream.current_release("billing").is_some()
            })
            .await
        );
        assert_eq!(stream.current_release("gateway"), Some(ResumeCursor::new(4, 40)));
        assert_eq!(stream.current_release("billing"), Some(ResumeCursor::new(2, 21)));
        let events = lock(&recorder.events).clone();
        assert!(matches!(events[1].notification, Notification::Reload(ref n) if n.reason == "drift"));
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn version_mismatch_abandons_the_stream_by_default() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(&upstream, fast_config()).await;
        let recorder = Arc::new(Recorder::default());
        stream.start_watch(recorder.clone()).await.expect("watch");

        let mut message = push("gateway", 1, 1);
        message.api_version = Some(
            ApiVersion {
                major: 9,
                minor: 0,
                patch: 0,
            }
            .into(),
        );
        assert!(upstream.push(message));

        let status = stream.status();
        assert!(eventually(Duration::from_secs(2), || !status.healthy()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.count(), 0);
        assert_eq!(upstream.watch_requests().len(), 1, "no automatic rewatch");
        assert!(status
            .last_error()
            .await
            .is_some_and(|err| err.contains("incompatible api version 9.0.0")));
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn version_mismatch_can_request_a_reconnect() {
        let upstream = ScriptedUpstream::new();
        let config = StreamConfig {
            version_mismatch_policy: VersionMismatchPolicy::Reconnect,
            ..fast_config()
        };
        let stream = connect(&upstream, config).await;
        stream
            .start_watch(Arc::new(Recorder::default()))
            .await
            .expect("watch");

        let mut message = push("gateway", 1, 1);
        message.api_version = None;
        assert!(upstream.push(message));

        assert!(eventually(Duration::from_secs(2), || upstream.watch_requests().len() == 2).await);
        assert_eq!(upstream.dial_count(), 2);
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn stream_failure_triggers_recovery() {
        let upstream = ScriptedUpstream::new();
        let telemetry = CountingTelemetry::default();
        let stream = FeedStream::builder(
            SidecarIdentity::new(7, ["gateway"]),
            upstream.dialer(),
            upstream.picker(),
        )
        .config(fast_config())
        .telemetry(Arc::new(telemetry.clone()))
        .connect()
        .await
        .expect("connect");
        stream
            .start_watch(Arc::new(Recorder::default()))
            .await
            .expect("watch");

        upstream.fail_next_dials(2);
        upstream.break_stream(tonic::Status::internal("reset"));

        let status = stream.status();
        assert!(eventually(Duration::from_secs(3), || status.reconnect_count() == 1).await);
        assert_eq!(upstream.watch_requests().len(), 2);
        assert_eq!(upstream.dial_count(), 4, "initial, two failures, one success");
        assert_eq!(
            status.last_reconnect_reason().await.as_deref(),
            Some(reconnect::WATCH_STREAM_CORRUPTED)
        );
        let snapshot = telemetry.counters().snapshot();
        assert_eq!(snapshot.reconnect_requested, 1);
        assert_eq!(snapshot.reconnect_complete, 1);
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn clean_stream_end_reconnects_and_rewatches() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(&upstream, fast_config()).await;
        stream
            .start_watch(Arc::new(Recorder::default()))
            .await
            .expect("watch");

        upstream.end_stream();

        let status = stream.status();
        assert!(eventually(Duration::from_secs(2), || status.reconnect_count() == 1).await);
        assert_eq!(upstream.watch_requests().len(), 2);
        assert_eq!(upstream.dial_count(), 2);
        assert_eq!(
            status.last_reconnect_reason().await.as_deref(),
            Some(reconnect::CONNECTION_CLOSED)
        );
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn scheduled_bounce_rebuilds_watch_with_a_single_dial() {
        let upstream = ScriptedUpstream::new();
        let telemetry = CountingTelemetry::default();
        let stream = FeedStream::builder(
            SidecarIdentity::new(7, ["gateway"]),
            upstream.dialer(),
            upstream.picker(),
        )
        .config(StreamConfig {
            default_bounce_interval: Duration::from_millis(150),
            ..fast_config()
        })
        .telemetry(Arc::new(telemetry.clone()))
        .connect()
        .await
        .expect("connect");
        stream
            .start_watch(Arc::new(Recorder::default()))
            .await
            .expect("watch");

        assert!(eventually(Duration::from_secs(2), || upstream.watch_requests().len() == 2).await);
        assert_eq!(upstream.dial_count(), 2, "stale close signal skips the redial");
        assert_eq!(upstream.close_count(), 1);
        assert_eq!(telemetry.counters().snapshot().scheduled_bounces, 1);
        assert_eq!(
            stream.status().last_reconnect_reason().await.as_deref(),
            Some(reconnect::CONNECTION_CLOSED)
        );
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn bounce_interval_change_applies_after_pending_sleep() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(
            &upstream,
            StreamConfig {
                default_bounce_interval: Duration::from_millis(150),
                ..fast_config()
            },
        )
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stream.upstream().enable_bounce(Duration::from_secs(3600)));
        assert_eq!(stream.upstream().bounce_interval(), Duration::from_secs(3600));

        assert!(
            eventually(Duration::from_secs(1), || upstream.dial_count() == 2).await,
            "pending sleep still uses the old interval"
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(upstream.dial_count(), 2, "next sleep uses the new interval");
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_retries_within_a_tick_before_signalling() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(
            &upstream,
            StreamConfig {
                heartbeat_interval: Duration::from_millis(40),
                heartbeat_retries: 3,
                ..fast_config()
            },
        )
        .await;

        upstream.fail_next_messages(2);
        assert!(eventually(Duration::from_secs(2), || !upstream.messages().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let failed = upstream.message_attempts() - upstream.messages().len();
        assert_eq!(failed, 2);
        assert_eq!(upstream.dial_count(), 1, "third attempt succeeded; no reconnect");
        assert_eq!(stream.status().reconnect_count(), 0);
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_tick_failing_every_attempt_requests_reconnect() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(
            &upstream,
            StreamConfig {
                heartbeat_interval: Duration::from_millis(40),
                heartbeat_retries: 3,
                ..fast_config()
            },
        )
        .await;

        upstream.fail_next_messages(3);
        let status = stream.status();
        assert!(eventually(Duration::from_secs(2), || status.reconnect_count() == 1).await);
        let failed = upstream.message_attempts() - upstream.messages().len();
        assert_eq!(failed, 3, "exactly one attempt per configured retry");
        assert_eq!(upstream.dial_count(), 2);
        assert_eq!(
            status.last_reconnect_reason().await.as_deref(),
            Some(reconnect::HEARTBEAT_FAILED)
        );
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_cap_gives_up_and_marks_unhealthy() {
        let upstream = ScriptedUpstream::new();
        let config = StreamConfig {
            max_recovery_attempts: Some(2),
            ..fast_config()
        };
        let stream = connect(&upstream, config).await;
        upstream.fail_next_dials(10);
        assert!(stream.notify_reconnect(None).await);

        let status = stream.status();
        assert!(eventually(Duration::from_secs(2), || {
            !status.reconnecting() && upstream.dial_count() == 3
        })
        .await);
        assert!(!status.healthy());
        assert!(status
            .last_error()
            .await
            .is_some_and(|err| err.contains("gave up after 2")));
        assert!(!stream.is_reconnecting());
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn version_change_and_offline_notices_are_sent() {
        let upstream = ScriptedUpstream::new();
        let stream = connect(&upstream, fast_config()).await;
        stream
            .set_current_release("billing", 12, 120)
            .expect("known app");
        assert!(matches!(
            stream.set_current_release("unknown", 1, 1),
            Err(StreamError::UnknownApp(_))
        ));

        stream
            .report_version_change("billing", ReleaseChangeStatus::Failed, Some("bad yaml".into()))
            .await
            .expect("version change sent");
        stream.shutdown().await;
        stream.shutdown().await;

        let sent = upstream.messages();
        assert_eq!(sent.len(), 2, "version change plus one offline notice");
        assert_eq!(sent[0].kind, MessagingType::VersionChange.as_u32());
        let body = sent[0].json();
        assert_eq!(body["application"]["currentReleaseID"], 12);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["reason"], "bad yaml");
        assert_eq!(sent[1].kind, MessagingType::SidecarOffline.as_u32());
        assert_eq!(sent[1].json()["basicData"]["bizID"], 7);

        assert!(matches!(
            stream.start_watch(Arc::new(Recorder::default())).await,
            Err(StreamError::Shutdown)
        ));
    }
}
