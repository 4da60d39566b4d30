//! Connection manager.
//!
//! [`UpstreamClient`] owns exactly one live connection handle and swaps it
//! atomically on redial. Every RPC first passes the reconnect gate so nothing
//! is dispatched against a handle that is being replaced, then attaches the
//! routing metadata computed once at startup.
//!
//! The manager never retries on its own: dial failures are returned to the
//! caller of [`UpstreamClient::dial`] / [`UpstreamClient::reconnect`] and the
//! reconnect coordinator decides how to pace the next attempt.

pub mod bounce;
pub mod grpc;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::Request;
use tracing::{debug, info, warn};

use crate::blocker::Blocker;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::proto::{HandshakeRequest, HandshakeResponse, MessagingRequest, WatchRequest};
use crate::retry::RetryConfig;
use crate::sfs::{MessagingType, SideWatchPayload, SidecarIdentity, CURRENT_API_VERSION};
use crate::status::StreamStatus;
use crate::telemetry::{NoopTelemetry, StreamTelemetry};

use self::bounce::BounceScheduler;
use self::transport::{Dialer, EndpointPicker, EventStream, UpstreamConnection};

/// Metadata key carrying the requesting user identity.
pub const USER_METADATA_KEY: &str = "user";
/// Metadata key carrying the serialised `{"bid","fpt"}` blob.
pub const SIDE_META_METADATA_KEY: &str = "side-meta";

/// Collaborators and knobs of an [`UpstreamClient`].
#[derive(Clone)]
pub struct UpstreamOptions {
    pub dial_timeout: Duration,
    /// Pacing used by the bounce scheduler when a scheduled redial fails.
    pub retry: RetryConfig,
    pub telemetry: Arc<dyn StreamTelemetry>,
    pub status: Arc<StreamStatus>,
    /// Cancelled on shutdown; stops the bounce scheduler and gate waits.
    pub shutdown: CancellationToken,
}

impl UpstreamOptions {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            retry: config.reconnect_retry,
            telemetry: Arc::new(NoopTelemetry),
            status: StreamStatus::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Installed connection and the generation it was installed at.
#[derive(Clone)]
struct Installed {
    conn: Arc<dyn UpstreamConnection>,
    generation: u64,
}

/// Owner of the upstream connection handle.
pub struct UpstreamClient {
    identity: Arc<SidecarIdentity>,
    dialer: Arc<dyn Dialer>,
    picker: Arc<dyn EndpointPicker>,
    dial_timeout: Duration,
    retry: RetryConfig,
    user: MetadataValue<Ascii>,
    side_meta: MetadataValue<Ascii>,
    installed: RwLock<Installed>,
    blocker: Blocker,
    bounce: BounceScheduler,
    telemetry: Arc<dyn StreamTelemetry>,
    status: Arc<StreamStatus>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("biz_id", &self.identity.biz_id)
            .field("dial_timeout", &self.dial_timeout)
            .field("blocked", &self.blocker.is_blocked())
            .finish_non_exhaustive()
    }
}

/// Releases the gate even when the reconnect future is dropped mid-dial.
struct UnblockOnDrop<'a>(&'a Blocker);

impl Drop for UnblockOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unblock();
    }
}

impl UpstreamClient {
    /// Performs the first dial. A failure here is returned to the caller and
    /// nothing is left running.
    pub async fn connect(
        identity: Arc<SidecarIdentity>,
        dialer: Arc<dyn Dialer>,
        picker: Arc<dyn EndpointPicker>,
        options: UpstreamOptions,
    ) -> Result<Arc<Self>, StreamError> {
        let user = ascii_metadata(USER_METADATA_KEY, &identity.user)?;
        let side_meta = ascii_metadata(SIDE_META_METADATA_KEY, &identity.side_meta()?)?;
        let dial_timeout = if options.dial_timeout.is_zero() {
            crate::config::DEFAULT_DIAL_TIMEOUT
        } else {
            options.dial_timeout
        };

        let conn = establish(
            dialer.as_ref(),
            picker.as_ref(),
            dial_timeout,
            options.telemetry.as_ref(),
        )
        .await?;
        options.status.record_connected(conn.endpoint()).await;
        info!(endpoint = conn.endpoint(), "connected to upstream");

        Ok(Arc::new(Self {
            identity,
            dialer,
            picker,
            dial_timeout,
            retry: options.retry,
            user,
            side_meta,
            installed: RwLock::new(Installed {
                conn,
                generation: 1,
            }),
            blocker: Blocker::new(),
            bounce: BounceScheduler::new(),
            telemetry: options.telemetry,
            status: options.status,
            shutdown: options.shutdown,
        }))
    }

    pub fn identity(&self) -> &SidecarIdentity {
        &self.identity
    }

    /// Generation of the currently installed handle; bumps on every successful dial.
    pub async fn generation(&self) -> u64 {
        self.installed.read().await.generation
    }

    /// Endpoint of the currently installed handle.
    pub async fn endpoint(&self) -> String {
        self.installed.read().await.conn.endpoint().to_string()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.blocker.is_blocked()
    }

    /// Dials a fresh endpoint and installs it, closing the previous handle.
    ///
    /// On failure the installed handle is left untouched.
    pub async fn dial(&self) -> Result<u64, StreamError> {
        let conn = establish(
            self.dialer.as_ref(),
            self.picker.as_ref(),
            self.dial_timeout,
            self.telemetry.as_ref(),
        )
        .await?;
        let endpoint = conn.endpoint().to_string();

        let (previous, generation) = {
            let mut installed = self.installed.write().await;
            let generation = installed.generation + 1;
            let previous = std::mem::replace(&mut *installed, Installed { conn, generation });
            (previous, generation)
        };
        if let Err(status) = previous.conn.close().await {
            warn!(
                endpoint = previous.conn.endpoint(),
                %status,
                "failed to close previous upstream connection"
            );
        }
        self.status.record_connected(&endpoint).await;
        info!(%endpoint, generation, "connected to upstream");
        Ok(generation)
    }

    /// Redials while holding the gate.
    ///
    /// Returns `Ok(())` immediately when another reconnect is already in
    /// flight; only the gate holder dials.
    pub async fn reconnect(&self) -> Result<(), StreamError> {
        if !self.blocker.try_block() {
            debug!("reconnect already in flight; skipping redial");
            return Ok(());
        }
        let _unblock = UnblockOnDrop(&self.blocker);
        self.dial().await.map(|_| ())
    }

    /// Starts the bounce scheduler, or only updates its interval when it already runs.
    pub fn enable_bounce(self: &Arc<Self>, interval: Duration) -> bool {
        self.bounce
            .enable(interval, Arc::downgrade(self), self.shutdown.clone())
    }

    /// Interval the bounce scheduler sleeps between redials.
    pub fn bounce_interval(&self) -> Duration {
        self.bounce.interval()
    }

    pub async fn handshake(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HandshakeResponse, StreamError> {
        let conn = self.gated(cancel).await?.conn;
        let request = HandshakeRequest {
            api_version: Some(CURRENT_API_VERSION.into()),
            spec: Some(self.identity.sidecar_spec()),
        };
        conn.handshake(self.request(request))
            .await
            .map_err(|status| StreamError::rpc("handshake", status))
    }

    /// Opens the watch stream; also returns the generation of the handle it runs on.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        payload: &SideWatchPayload,
    ) -> Result<(EventStream, u64), StreamError> {
        let installed = self.gated(cancel).await?;
        let request = WatchRequest {
            api_version: Some(CURRENT_API_VERSION.into()),
            payload: serde_json::to_vec(payload)?,
        };
        let stream = installed
            .conn
            .watch(self.request(request))
            .await
            .map_err(|status| StreamError::rpc("watch", status))?;
        Ok((stream, installed.generation))
    }

    pub async fn messaging(
        &self,
        cancel: &CancellationToken,
        kind: MessagingType,
        payload: Vec<u8>,
    ) -> Result<(), StreamError> {
        let conn = self.gated(cancel).await?.conn;
        let request = MessagingRequest {
            r#type: kind.as_u32(),
            payload,
        };
        conn.messaging(self.request(request))
            .await
            .map(|_| ())
            .map_err(|status| StreamError::rpc("messaging", status))
    }

    /// Stops the bounce scheduler and closes the installed handle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.bounce.stop();
        let conn = self.installed.read().await.conn.clone();
        if let Err(status) = conn.close().await {
            warn!(endpoint = conn.endpoint(), %status, "failed to close upstream connection");
        }
    }

    /// Waits for the gate, then takes a momentary reference to the handle.
    async fn gated(&self, cancel: &CancellationToken) -> Result<Installed, StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::Shutdown);
        }
        self.blocker.wait_with_cancel(cancel).await?;
        Ok(self.installed.read().await.clone())
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(USER_METADATA_KEY, self.user.clone());
        metadata.insert(SIDE_META_METADATA_KEY, self.side_meta.clone());
        request
    }
}

async fn establish(
    dialer: &dyn Dialer,
    picker: &dyn EndpointPicker,
    timeout: Duration,
    telemetry: &dyn StreamTelemetry,
) -> Result<Arc<dyn UpstreamConnection>, StreamError> {
    let endpoint = picker.pick_one()?;
    debug!(%endpoint, timeout_ms = timeout.as_millis() as u64, "dialing upstream");
    let result = dialer.dial(&endpoint, timeout).await;
    telemetry.on_dial(&endpoint, result.is_ok());
    if let Err(err) = &result {
        warn!(%endpoint, error = %err, "dial failed");
    }
    result
}

fn ascii_metadata(key: &str, value: &str) -> Result<MetadataValue<Ascii>, StreamError> {
    MetadataValue::try_from(value)
        .map_err(|_| StreamError::InvalidConfig(format!("{key} metadata must be visible ASCII")))
}
