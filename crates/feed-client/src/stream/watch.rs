//! Watch loop.
//!
//! One server stream delivers every event for the sidecar's applications.
//! The receive loop ends exactly once: silently when the watch is closed, or
//! after raising a reconnect signal when the stream ends, fails, or the
//! upstream requests a bounce.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::reconnect::{
    BOUNCE_REQUESTED, CONNECTION_CLOSED, INCOMPATIBLE_VERSION, WATCH_STREAM_CORRUPTED,
};
use super::{ReleaseChangeHandler, StreamInner};
use crate::config::VersionMismatchPolicy;
use crate::error::StreamError;
use crate::proto::FeedWatchMessage;
use crate::sfs::{is_api_version_match, ApiVersion, FeedMessageType, ReleaseChangeEvent};
use crate::upstream::transport::EventStream;

/// A running receive loop and the token that closes it.
pub(super) struct WatchSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchSession {
    /// Cancels the receive loop and waits for it to exit.
    pub(super) async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            if err.is_panic() {
                error!("watch receive loop panicked");
            }
        }
    }
}

/// Whether the receive loop keeps reading after a message.
enum Flow {
    Continue,
    Stop,
}

impl StreamInner {
    /// Opens a watch with the current resume cursors and spawns its receive loop.
    pub(super) async fn open_watch(
        self: &Arc<Self>,
        handler: Arc<dyn ReleaseChangeHandler>,
    ) -> Result<(), StreamError> {
        let payload = self.watch_payload();
        let (stream, generation) = self.upstream.watch(&self.shutdown, &payload).await?;
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(self.clone().receive(
            stream,
            generation,
            cancel.clone(),
            handler,
        ));
        info!(
            generation,
            applications = payload.applications.len(),
            "watch started"
        );

        let previous = self.replace_watch(Some(WatchSession { cancel, task }));
        if let Some(previous) = previous {
            warn!("replacing a watch that was still open");
            previous.close().await;
        }
        Ok(())
    }

    /// Stops the current receive loop, if any. The old stream delivers nothing afterwards.
    pub(super) async fn close_watch(&self) {
        if let Some(session) = self.replace_watch(None) {
            session.close().await;
            debug!("watch closed");
        }
    }

    async fn receive(
        self: Arc<Self>,
        mut stream: EventStream,
        generation: u64,
        cancel: CancellationToken,
        handler: Arc<dyn ReleaseChangeHandler>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                None => {
                    info!(generation, "watch stream ended");
                    self.notifier.notify(CONNECTION_CLOSED, generation);
                    return;
                }
                Some(Err(status)) => {
                    warn!(generation, %status, "watch stream failed");
                    self.notifier.notify(WATCH_STREAM_CORRUPTED, generation);
                    return;
                }
                Some(Ok(message)) => {
                    if let Flow::Stop = self.dispatch(message, generation, &handler).await {
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        message: FeedWatchMessage,
        generation: u64,
        handler: &Arc<dyn ReleaseChangeHandler>,
    ) -> Flow {
        let version = message.api_version.as_ref().map(ApiVersion::from);
        let version = match version {
            Some(version) if is_api_version_match(&version) => version,
            other => {
                self.on_version_mismatch(other, &message.rid, generation).await;
                return Flow::Stop;
            }
        };

        match FeedMessageType::from(message.r#type) {
            FeedMessageType::Bounce => {
                info!(rid = %message.rid, "received bounce request");
                self.telemetry.on_bounce(false);
                self.notifier.notify(BOUNCE_REQUESTED, generation);
                Flow::Stop
            }
            FeedMessageType::PublishRelease => {
                match ReleaseChangeEvent::decode(message.rid, version, &message.payload) {
                    Ok(event) => self.deliver(event, handler).await,
                    Err(err) => warn!(error = %err, "dropping undecodable release event"),
                }
                Flow::Continue
            }
            FeedMessageType::Unknown(kind) => {
                warn!(kind, rid = %message.rid, "ignoring unrecognised feed message");
                Flow::Continue
            }
        }
    }

    async fn deliver(&self, event: ReleaseChangeEvent, handler: &Arc<dyn ReleaseChangeHandler>) {
        debug!(rid = %event.rid, app = ?event.notification.app(), "release event received");
        self.telemetry.on_release_event(&event);
        handler.on_release_change(&event).await;

        let (Some(app), Some(cursor)) = (event.notification.app(), event.notification.resume_cursor())
        else {
            return;
        };
        if self.identity.find_app(app).is_none() {
            warn!(app, rid = %event.rid, "release event for an application this sidecar does not watch");
            return;
        }
        self.record_cursor(app, cursor);
    }

    async fn on_version_mismatch(&self, version: Option<ApiVersion>, rid: &str, generation: u64) {
        let found = version
            .map(|version| version.to_string())
            .unwrap_or_else(|| "none".to_string());
        match self.config.version_mismatch_policy {
            VersionMismatchPolicy::Abandon => {
                error!(
                    version = %found,
                    rid,
                    "incompatible api version on watch stream; abandoning stream"
                );
                self.status
                    .record_failure(format!("{INCOMPATIBLE_VERSION} {found}"))
                    .await;
            }
            VersionMismatchPolicy::Reconnect => {
                warn!(
                    version = %found,
                    rid,
                    "incompatible api version on watch stream; requesting reconnect"
                );
                self.notifier.notify(INCOMPATIBLE_VERSION, generation);
            }
        }
    }
}
