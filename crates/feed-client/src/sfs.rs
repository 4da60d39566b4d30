//! Sidecar/feed-server shared payloads.
//!
//! The gRPC envelopes in [`crate::proto`] carry opaque byte payloads; this
//! module defines the JSON documents that travel inside them together with the
//! identity, cursor, and version types the stream components pass around.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::proto;

/// Protocol version spoken by this client.
pub const CURRENT_API_VERSION: ApiVersion = ApiVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Identity reported as the requesting user when none is configured.
pub const DEFAULT_USER: &str = "feed-sidecar";

/// Semantic protocol version exchanged during handshake and on every feed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl From<&proto::Versioning> for ApiVersion {
    fn from(value: &proto::Versioning) -> Self {
        Self {
            major: value.major,
            minor: value.minor,
            patch: value.patch,
        }
    }
}

impl From<ApiVersion> for proto::Versioning {
    fn from(value: ApiVersion) -> Self {
        Self {
            major: value.major,
            minor: value.minor,
            patch: value.patch,
        }
    }
}

/// Returns whether the upstream version can be spoken by this client.
///
/// Versions are compatible when their major components agree; minor and
/// patch bumps are additive on the wire.
pub fn is_api_version_match(version: &ApiVersion) -> bool {
    version.major == CURRENT_API_VERSION.major
}

/// Application served by this sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    /// Application name as registered upstream.
    pub name: String,
    /// Per-application instance id; defaults to the sidecar fingerprint.
    pub uid: String,
}

/// Immutable identity of the sidecar process, attached to every upstream call.
#[derive(Debug, Clone)]
pub struct SidecarIdentity {
    /// Business the applications belong to.
    pub biz_id: u32,
    /// Optional namespace used by the upstream for routing.
    pub namespace: Option<String>,
    /// Unique id of this sidecar instance.
    pub fingerprint: String,
    /// Requesting user identity sent as routing metadata.
    pub user: String,
    /// Labels shared by every application of this sidecar.
    pub labels: BTreeMap<String, String>,
    /// Applications watched by this sidecar.
    pub apps: Vec<AppIdentity>,
}

impl SidecarIdentity {
    /// Builds an identity with a freshly generated fingerprint.
    ///
    /// Application names without an explicit uid inherit the fingerprint.
    pub fn new<I, S>(biz_id: u32, apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fingerprint = uuid::Uuid::new_v4().to_string();
        let apps = apps
            .into_iter()
            .map(|name| AppIdentity {
                name: name.into(),
                uid: fingerprint.clone(),
            })
            .collect();
        Self {
            biz_id,
            namespace: None,
            fingerprint,
            user: DEFAULT_USER.to_string(),
            labels: BTreeMap::new(),
            apps,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Overrides the uid of a single application.
    pub fn with_app_uid(mut self, app: &str, uid: impl Into<String>) -> Self {
        let uid = uid.into();
        if let Some(entry) = self.apps.iter_mut().find(|entry| entry.name == app) {
            entry.uid = uid;
        }
        self
    }

    /// Serialises the opaque `side-meta` routing blob.
    pub fn side_meta(&self) -> Result<String, StreamError> {
        #[derive(Serialize)]
        struct SideMeta<'a> {
            bid: u32,
            fpt: &'a str,
        }
        let meta = SideMeta {
            bid: self.biz_id,
            fpt: &self.fingerprint,
        };
        Ok(serde_json::to_string(&meta)?)
    }

    /// Returns the handshake description of this sidecar.
    pub(crate) fn sidecar_spec(&self) -> proto::SidecarSpec {
        proto::SidecarSpec {
            biz_id: self.biz_id,
            version: Some(CURRENT_API_VERSION.into()),
            namespace: self.namespace.clone().unwrap_or_default(),
            apps: self
                .apps
                .iter()
                .map(|app| proto::SidecarApp {
                    app: app.name.clone(),
                    uid: app.uid.clone(),
                    labels: self.labels.clone().into_iter().collect(),
                })
                .collect(),
        }
    }

    /// Builds per-application metadata using the supplied resume cursors.
    pub(crate) fn app_metas(&self, cursors: &HashMap<String, ResumeCursor>) -> Vec<SideAppMeta> {
        self.apps
            .iter()
            .map(|app| self.app_meta(app, cursors.get(&app.name).copied().unwrap_or_default()))
            .collect()
    }

    pub(crate) fn app_meta(&self, app: &AppIdentity, cursor: ResumeCursor) -> SideAppMeta {
        SideAppMeta {
            app: app.name.clone(),
            uid: app.uid.clone(),
            labels: self.labels.clone(),
            current_release_id: cursor.release_id,
            current_cursor_id: cursor.cursor_id,
        }
    }

    pub(crate) fn basic_data(&self) -> BasicData {
        BasicData {
            biz_id: self.biz_id,
            fingerprint: self.fingerprint.clone(),
            namespace: self.namespace.clone(),
            version: CURRENT_API_VERSION.to_string(),
        }
    }

    pub(crate) fn find_app(&self, name: &str) -> Option<&AppIdentity> {
        self.apps.iter().find(|app| app.name == name)
    }
}

/// Last release and cursor an application has seen; zero means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCursor {
    pub release_id: u32,
    pub cursor_id: u32,
}

impl ResumeCursor {
    pub fn new(release_id: u32, cursor_id: u32) -> Self {
        Self {
            release_id,
            cursor_id,
        }
    }
}

/// Application entry of the watch, heartbeat, and version-change payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideAppMeta {
    pub app: String,
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(rename = "currentReleaseID")]
    pub current_release_id: u32,
    #[serde(rename = "currentCursorID")]
    pub current_cursor_id: u32,
}

/// Body of a watch request: where each application should resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideWatchPayload {
    #[serde(rename = "bizID")]
    pub biz_id: u32,
    pub applications: Vec<SideAppMeta>,
}

/// Server-provided details returned by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandshakePayload {
    pub service_info: ServiceInfo,
    pub runtime_option: RuntimeOption,
}

impl HandshakePayload {
    /// Decodes the handshake payload; an empty payload yields the defaults.
    pub fn decode(raw: &[u8]) -> Result<Self, StreamError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    pub name: String,
    pub ip: String,
}

/// Runtime options the upstream assigns to this sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOption {
    pub bounce_interval_hour: u32,
}

impl RuntimeOption {
    /// Returns the bounce interval, falling back to `default` when the server sent none.
    pub fn bounce_interval(&self, default: Duration) -> Duration {
        if self.bounce_interval_hour == 0 {
            default
        } else {
            Duration::from_secs(u64::from(self.bounce_interval_hour) * 60 * 60)
        }
    }
}

/// Kind of a message received on the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMessageType {
    /// The upstream asks the sidecar to reconnect elsewhere.
    Bounce,
    /// A release event for one of the watched applications.
    PublishRelease,
    /// Kind introduced by a newer upstream.
    Unknown(u32),
}

impl From<u32> for FeedMessageType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Bounce,
            2 => Self::PublishRelease,
            other => Self::Unknown(other),
        }
    }
}

impl FeedMessageType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Bounce => 1,
            Self::PublishRelease => 2,
            Self::Unknown(other) => other,
        }
    }
}

/// Payload of a `PublishRelease` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Notification {
    /// A new release was published.
    Push(PushNotification),
    /// The application was rolled back to an earlier release.
    Rollback(RollbackNotification),
    /// The current release should be re-applied.
    Reload(ReloadNotification),
    /// Notification kind introduced by a newer upstream.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub app: String,
    #[serde(rename = "releaseID")]
    pub release_id: u32,
    #[serde(rename = "releaseName", default)]
    pub release_name: String,
    #[serde(rename = "cursorID")]
    pub cursor_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackNotification {
    pub app: String,
    #[serde(rename = "releaseID")]
    pub release_id: u32,
    #[serde(rename = "previousReleaseID", default)]
    pub previous_release_id: u32,
    #[serde(rename = "cursorID")]
    pub cursor_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadNotification {
    pub app: String,
    #[serde(rename = "releaseID")]
    pub release_id: u32,
    #[serde(rename = "cursorID")]
    pub cursor_id: u32,
    #[serde(default)]
    pub reason: String,
}

impl Notification {
    /// Application the notification targets, if the kind is known.
    pub fn app(&self) -> Option<&str> {
        match self {
            Self::Push(n) => Some(&n.app),
            Self::Rollback(n) => Some(&n.app),
            Self::Reload(n) => Some(&n.app),
            Self::Unknown => None,
        }
    }

    /// Cursor the application reaches once the notification has been applied.
    pub fn resume_cursor(&self) -> Option<ResumeCursor> {
        match self {
            Self::Push(n) => Some(ResumeCursor::new(n.release_id, n.cursor_id)),
            Self::Rollback(n) => Some(ResumeCursor::new(n.release_id, n.cursor_id)),
            Self::Reload(n) => Some(ResumeCursor::new(n.release_id, n.cursor_id)),
            Self::Unknown => None,
        }
    }
}

/// Release event delivered to the application callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseChangeEvent {
    /// Request id assigned by the upstream (for log correlation).
    pub rid: String,
    /// Version the upstream stamped on the message.
    pub api_version: ApiVersion,
    pub notification: Notification,
}

impl ReleaseChangeEvent {
    pub fn decode(rid: String, api_version: ApiVersion, raw: &[u8]) -> Result<Self, StreamError> {
        let notification = serde_json::from_slice(raw)?;
        Ok(Self {
            rid,
            api_version,
            notification,
        })
    }
}

/// Kind of a sidecar-to-upstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingType {
    Heartbeat,
    VersionChange,
    SidecarOffline,
}

impl MessagingType {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Heartbeat => 1,
            Self::VersionChange => 2,
            Self::SidecarOffline => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::VersionChange => "version-change",
            Self::SidecarOffline => "sidecar-offline",
        }
    }
}

/// Fields common to every sidecar-originated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicData {
    #[serde(rename = "bizID")]
    pub biz_id: u32,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub namespace: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub basic_data: BasicData,
    pub applications: Vec<SideAppMeta>,
    /// Unix timestamp (seconds) at which the payload was built.
    pub heartbeat_time: u64,
}

/// Outcome of applying a release, reported through `VersionChange` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChangeStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionChangePayload {
    pub basic_data: BasicData,
    pub application: SideAppMeta,
    pub status: ReleaseChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePayload {
    pub basic_data: BasicData,
}

/// Seconds since the Unix epoch, saturating to zero on clock skew.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
