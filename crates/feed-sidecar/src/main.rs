// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use feed_client::{
    CountingTelemetry, FeedClientEnv, FeedStream, GrpcDialer, Notification, ReleaseChangeEvent,
    ReleaseChangeHandler, ReleaseChangeStatus, ResumeCursor, RoundRobinPicker,
};

/// Applied releases waiting to be reported upstream.
const REPORT_QUEUE_CAPACITY: usize = 64;

/// Logs every release event and queues a version-change report for it.
struct LoggingHandler {
    reports: mpsc::Sender<(String, ResumeCursor)>,
}

#[async_trait]
impl ReleaseChangeHandler for LoggingHandler {
    async fn on_release_change(&self, event: &ReleaseChangeEvent) {
        match &event.notification {
            Notification::Push(push) => info!(
                rid = %event.rid,
                app = %push.app,
                release_id = push.release_id,
                release_name = %push.release_name,
                "release published"
            ),
            Notification::Rollback(rollback) => info!(
                rid = %event.rid,
                app = %rollback.app,
                release_id = rollback.release_id,
                previous_release_id = rollback.previous_release_id,
                "release rolled back"
            ),
            Notification::Reload(reload) => info!(
                rid = %event.rid,
                app = %reload.app,
                release_id = reload.release_id,
                reason = %reload.reason,
                "release reload requested"
            ),
            Notification::Unknown => {
                debug!(rid = %event.rid, "ignoring notification of unknown kind");
                return;
            }
        }
        let notification = &event.notification;
        if let (Some(app), Some(cursor)) = (notification.app(), notification.resume_cursor()) {
            if self.reports.try_send((app.to_string(), cursor)).is_err() {
                warn!(app, "version-change report queue full; skipping report");
            }
        }
    }
}

#[tokio::main]
pub async fn main() {
    let env = FeedClientEnv::from_os_env();

    let env_filter = format!("h2=off,hyper=off,tower=off,rustls=off,{}", env.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let identity = match env.to_identity() {
        Ok(identity) => identity,
        Err(err) => {
            error!("{err}. Shutting down feed sidecar.");
            return;
        }
    };
    let picker = match env
        .require_endpoints()
        .and_then(RoundRobinPicker::new)
    {
        Ok(picker) => Arc::new(picker),
        Err(err) => {
            error!("{err}. Shutting down feed sidecar.");
            return;
        }
    };
    let dialer = match GrpcDialer::from_settings(env.tls.as_ref()) {
        Ok(dialer) => Arc::new(dialer),
        Err(err) => {
            error!("{err}. Shutting down feed sidecar.");
            return;
        }
    };

    let telemetry = CountingTelemetry::default();
    let stream = match FeedStream::builder(identity, dialer, picker)
        .config(env.to_stream_config())
        .telemetry(Arc::new(telemetry.clone()))
        .connect()
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            error!("unable to start feed stream: {err}");
            return;
        }
    };
    info!(
        biz_id = stream.identity().biz_id,
        fingerprint = %stream.identity().fingerprint,
        "feed stream connected"
    );

    let (reports_tx, mut reports_rx) = mpsc::channel(REPORT_QUEUE_CAPACITY);
    let handler = Arc::new(LoggingHandler {
        reports: reports_tx,
    });
    if let Err(err) = stream.start_watch(handler).await {
        error!("unable to start watch: {err}");
        stream.shutdown().await;
        return;
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("unable to listen for shutdown signal: {err}");
                }
                break;
            }
            Some((app, cursor)) = reports_rx.recv() => {
                let result = match stream.set_current_release(&app, cursor.release_id, cursor.cursor_id) {
                    Ok(()) => {
                        stream
                            .report_version_change(&app, ReleaseChangeStatus::Success, None)
                            .await
                    }
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    warn!(%app, "failed to report version change: {err}");
                }
            }
        }
    }

    info!("shutting down feed sidecar");
    stream.shutdown().await;
    info!("feed stream telemetry: {}", telemetry.counters().snapshot());
    debug!("final status: {}", stream.status().to_json().await);
}
