//! Configuration for the feed client.
//!
//! [`StreamConfig`] carries the timing knobs of every background loop with
//! defaults matching the upstream's expectations; [`FeedClientEnv`] derives
//! the process-level settings (endpoints, identity, TLS) from environment
//! variables so embedders do not need their own parsing.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use tracing::warn;

use crate::error::StreamError;
use crate::retry::{BackoffWindow, RetryConfig};
use crate::sfs::{SidecarIdentity, DEFAULT_USER};

/// Default timeout applied to each dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Default per-call heartbeat timeout.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of heartbeat sends per tick before a reconnect is requested.
pub const DEFAULT_HEARTBEAT_RETRIES: u32 = 3;
/// Default randomized pause between heartbeat retries.
pub const DEFAULT_HEARTBEAT_BACKOFF: BackoffWindow = BackoffWindow::from_millis(1000, 3000);
/// Bounce interval used when the upstream does not assign one.
pub const DEFAULT_BOUNCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Capacity of the reconnect signal queue.
pub const DEFAULT_RECONNECT_QUEUE_CAPACITY: usize = 5;
/// Largest accepted reconnect queue; signals past a handful are coalesced anyway.
pub const MAX_RECONNECT_QUEUE_CAPACITY: usize = 1024;

/// What the watch loop does when a message carries an incompatible api version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionMismatchPolicy {
    /// Log, mark the stream unhealthy, and stop the receive loop without recovery.
    #[default]
    Abandon,
    /// Treat the mismatch like a broken stream and request a reconnect.
    Reconnect,
}

/// Timing and recovery settings of the stream components.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upper bound of a single dial attempt.
    pub dial_timeout: Duration,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// Timeout of a single heartbeat call, including any wait on the reconnect gate.
    pub heartbeat_timeout: Duration,
    /// Heartbeat sends per tick before a reconnect is requested.
    pub heartbeat_retries: u32,
    /// Randomized pause between heartbeat sends of one tick.
    pub heartbeat_backoff: BackoffWindow,
    /// Pacing of reconnect, re-watch, and bounce attempts.
    pub reconnect_retry: RetryConfig,
    /// Bounce interval used when the handshake does not provide one.
    pub default_bounce_interval: Duration,
    /// Capacity of the reconnect signal queue; overflowing signals are dropped.
    pub reconnect_queue_capacity: usize,
    /// Optional cap on attempts per recovery step; `None` retries forever.
    pub max_recovery_attempts: Option<u32>,
    /// Reaction to an incompatible api version on the watch stream.
    pub version_mismatch_policy: VersionMismatchPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_retries: DEFAULT_HEARTBEAT_RETRIES,
            heartbeat_backoff: DEFAULT_HEARTBEAT_BACKOFF,
            reconnect_retry: RetryConfig::default(),
            default_bounce_interval: DEFAULT_BOUNCE_INTERVAL,
            reconnect_queue_capacity: DEFAULT_RECONNECT_QUEUE_CAPACITY,
            max_recovery_attempts: None,
            version_mismatch_policy: VersionMismatchPolicy::Abandon,
        }
    }
}

impl StreamConfig {
    /// Replaces unusable values with their defaults, logging each correction.
    pub fn sanitise(mut self) -> Self {
        if self.dial_timeout.is_zero() {
            warn!(
                "dial timeout must be > 0; defaulting to {:?}",
                DEFAULT_DIAL_TIMEOUT
            );
            self.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if self.heartbeat_interval.is_zero() {
            warn!(
                "heartbeat interval must be > 0; defaulting to {:?}",
                DEFAULT_HEARTBEAT_INTERVAL
            );
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        if self.heartbeat_timeout.is_zero() {
            warn!(
                "heartbeat timeout must be > 0; defaulting to {:?}",
                DEFAULT_HEARTBEAT_TIMEOUT
            );
            self.heartbeat_timeout = DEFAULT_HEARTBEAT_TIMEOUT;
        }
        if self.heartbeat_retries == 0 {
            warn!(
                "heartbeat retries must be >= 1; defaulting to {}",
                DEFAULT_HEARTBEAT_RETRIES
            );
            self.heartbeat_retries = DEFAULT_HEARTBEAT_RETRIES;
        }
        if !self.heartbeat_backoff.is_valid() {
            warn!(
                "heartbeat backoff window {:?} is invalid; using {:?}",
                self.heartbeat_backoff, DEFAULT_HEARTBEAT_BACKOFF
            );
            self.heartbeat_backoff = DEFAULT_HEARTBEAT_BACKOFF;
        }
        if !self.reconnect_retry.window.is_valid() {
            warn!(
                "reconnect backoff window {:?} is invalid; using the default window",
                self.reconnect_retry.window
            );
            self.reconnect_retry = RetryConfig::default();
        }
        if self.default_bounce_interval.is_zero() {
            warn!(
                "default bounce interval must be > 0; defaulting to {:?}",
                DEFAULT_BOUNCE_INTERVAL
            );
            self.default_bounce_interval = DEFAULT_BOUNCE_INTERVAL;
        }
        if self.reconnect_queue_capacity == 0 {
            warn!(
                "reconnect queue capacity must be >= 1; defaulting to {}",
                DEFAULT_RECONNECT_QUEUE_CAPACITY
            );
            self.reconnect_queue_capacity = DEFAULT_RECONNECT_QUEUE_CAPACITY;
        } else if self.reconnect_queue_capacity > MAX_RECONNECT_QUEUE_CAPACITY {
            warn!(
                "reconnect queue capacity {} is too large; capping at {}",
                self.reconnect_queue_capacity, MAX_RECONNECT_QUEUE_CAPACITY
            );
            self.reconnect_queue_capacity = MAX_RECONNECT_QUEUE_CAPACITY;
        }
        if self.max_recovery_attempts == Some(0) {
            warn!("max recovery attempts of 0 disables recovery; retrying forever instead");
            self.max_recovery_attempts = None;
        }
        self
    }
}

/// Comma separated upstream endpoints (`host:port` or full URIs).
const ENV_ENDPOINTS: &str = "FEED_ENDPOINTS";
/// Business id the sidecar serves.
const ENV_BIZ_ID: &str = "FEED_BIZ_ID";
/// Comma separated applications; `app:uid` pins a per-application uid.
const ENV_APPS: &str = "FEED_APPS";
const ENV_NAMESPACE: &str = "FEED_NAMESPACE";
/// Comma separated `key=value` labels.
const ENV_LABELS: &str = "FEED_LABELS";
const ENV_USER: &str = "FEED_USER";
const ENV_DIAL_TIMEOUT_MS: &str = "FEED_DIAL_TIMEOUT_MS";
/// PEM bundle used to verify the upstream certificate; enables TLS when set.
const ENV_TLS_CA_FILE: &str = "FEED_TLS_CA_FILE";
/// Domain name expected in the upstream certificate.
const ENV_TLS_DOMAIN: &str = "FEED_TLS_DOMAIN";
const ENV_LOG_LEVEL: &str = "FEED_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: &str = "info";

/// TLS settings handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Path to a PEM encoded CA bundle.
    pub ca_file: String,
    /// Expected server name; defaults to the endpoint host.
    pub domain: Option<String>,
}

/// Settings captured from the process environment.
#[derive(Debug, Clone)]
pub struct FeedClientEnv {
    pub endpoints: Vec<String>,
    pub biz_id: Option<u32>,
    /// Applications with an optional pinned uid.
    pub apps: Vec<(String, Option<String>)>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub user: String,
    pub dial_timeout: Option<Duration>,
    pub tls: Option<TlsSettings>,
    pub log_level: String,
}

impl FeedClientEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));

        let endpoints = get(ENV_ENDPOINTS)
            .map(|value| split_list(&value))
            .unwrap_or_default();
        let biz_id = get(ENV_BIZ_ID).and_then(|value| value.parse::<u32>().ok());
        let apps = get(ENV_APPS)
            .map(|value| {
                split_list(&value)
                    .into_iter()
                    .map(|entry| match entry.split_once(':') {
                        Some((app, uid)) => (app.trim().to_string(), sanitize_non_empty(uid)),
                        None => (entry, None),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let labels = get(ENV_LABELS)
            .map(|value| parse_labels(&value))
            .unwrap_or_default();
        let dial_timeout = get(ENV_DIAL_TIMEOUT_MS)
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let tls = get(ENV_TLS_CA_FILE).map(|ca_file| TlsSettings {
            ca_file,
            domain: get(ENV_TLS_DOMAIN),
        });

        Self {
            endpoints,
            biz_id,
            apps,
            namespace: get(ENV_NAMESPACE),
            labels,
            user: get(ENV_USER).unwrap_or_else(|| DEFAULT_USER.to_string()),
            dial_timeout,
            tls,
            log_level: get(ENV_LOG_LEVEL)
                .map(|level| level.to_lowercase())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        }
    }

    /// Builds the sidecar identity, failing when required values are missing.
    pub fn to_identity(&self) -> Result<SidecarIdentity, StreamError> {
        let biz_id = self
            .biz_id
            .ok_or_else(|| StreamError::InvalidConfig(format!("{ENV_BIZ_ID} is required")))?;
        if self.apps.is_empty() {
            return Err(StreamError::InvalidConfig(format!(
                "{ENV_APPS} must name at least one application"
            )));
        }
        let mut identity = SidecarIdentity::new(biz_id, self.apps.iter().map(|(app, _)| app))
            .with_user(self.user.clone())
            .with_labels(self.labels.clone());
        if let Some(namespace) = &self.namespace {
            identity = identity.with_namespace(namespace.clone());
        }
        for (app, uid) in &self.apps {
            if let Some(uid) = uid {
                identity = identity.with_app_uid(app, uid.clone());
            }
        }
        Ok(identity)
    }

    /// Returns the endpoint list, failing when none is configured.
    pub fn require_endpoints(&self) -> Result<Vec<String>, StreamError> {
        if self.endpoints.is_empty() {
            return Err(StreamError::InvalidConfig(format!(
                "{ENV_ENDPOINTS} must list at least one endpoint"
            )));
        }
        Ok(self.endpoints.clone())
    }

    /// Applies the environment overrides on top of the default stream configuration.
    pub fn to_stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::default();
        if let Some(timeout) = self.dial_timeout {
            config.dial_timeout = timeout;
        }
        config
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').filter_map(sanitize_non_empty).collect()
}

fn parse_labels(value: &str) -> BTreeMap<String, String> {
    split_list(value)
        .into_iter()
        .filter_map(|pair| match pair.split_once('=') {
            Some((key, val)) => sanitize_non_empty(key).map(|key| (key, val.trim().to_string())),
            None => {
                warn!(label = %pair, "ignoring label without '='");
                None
            }
        })
        .collect()
}
