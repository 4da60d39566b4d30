//! Resilient feed-stream client for the config-distribution sidecar.
//!
//! The crate keeps one long-lived connection to the upstream feed service,
//! watches release events for the sidecar's applications, and recovers from
//! transport failures without losing the applications' resume positions.
//! [`FeedStream`] is the entry point; the remaining modules are its building
//! blocks and can be embedded on their own.

pub mod blocker;
pub mod config;
pub mod error;
pub mod proto;
pub mod retry;
pub mod sfs;
pub mod status;
pub mod stream;
pub mod telemetry;
mod test_support;
pub mod upstream;

pub use blocker::Blocker;
pub use config::{FeedClientEnv, StreamConfig, TlsSettings, VersionMismatchPolicy};
pub use error::StreamError;
pub use retry::{BackoffWindow, RetryConfig, RetryPolicy};
pub use sfs::{
    is_api_version_match, ApiVersion, AppIdentity, FeedMessageType, HandshakePayload,
    MessagingType, Notification, PushNotification, ReleaseChangeEvent, ReleaseChangeStatus,
    ReloadNotification, ResumeCursor, RollbackNotification, SidecarIdentity, CURRENT_API_VERSION,
};
pub use status::{StatusSnapshot, StreamStatus};
pub use stream::reconnect::ReconnectSignal;
pub use stream::{FeedStream, FeedStreamBuilder, ReleaseChangeHandler};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, StreamTelemetry, TelemetryCounters,
    TelemetrySnapshot,
};
pub use upstream::bounce::BounceScheduler;
pub use upstream::grpc::GrpcDialer;
pub use upstream::transport::{
    Dialer, EndpointPicker, EventStream, RoundRobinPicker, UpstreamConnection,
};
pub use upstream::{UpstreamClient, UpstreamOptions};
