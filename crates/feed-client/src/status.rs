//! Health handle shared between the stream components and the embedder.
//!
//! Loops record what they observe; embedders read a [`StatusSnapshot`] or its
//! JSON rendering to expose liveness.

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Connection health of a feed stream.
#[derive(Debug, Default)]
pub struct StreamStatus {
    healthy: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_count: AtomicU64,
    endpoint: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    last_reconnect_reason: RwLock<Option<String>>,
}

impl StreamStatus {
    /// Creates a status handle that reports unhealthy until the first connection.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Relaxed)
    }

    /// Number of completed recovery episodes.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.endpoint.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn last_reconnect_reason(&self) -> Option<String> {
        self.last_reconnect_reason.read().await.clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub(crate) async fn record_connected(&self, endpoint: &str) {
        *self.endpoint.write().await = Some(endpoint.to_string());
        self.set_healthy(true);
    }

    /// Marks the stream unhealthy and stores the cause.
    pub(crate) async fn record_failure(&self, error: impl Into<String>) {
        self.set_healthy(false);
        *self.last_error.write().await = Some(error.into());
    }

    pub(crate) async fn begin_reconnect(&self, reason: &str) {
        self.reconnecting.store(true, Ordering::Relaxed);
        *self.last_reconnect_reason.write().await = Some(reason.to_string());
    }

    /// Ends a recovery episode; `recovered` bumps the counter and clears the error.
    pub(crate) async fn end_reconnect(&self, recovered: bool) {
        self.reconnecting.store(false, Ordering::Relaxed);
        if recovered {
            self.reconnect_count.fetch_add(1, Ordering::Relaxed);
            self.set_healthy(true);
            *self.last_error.write().await = None;
        }
    }

    /// Returns a point-in-time copy of every field.
    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            healthy: self.healthy(),
            reconnecting: self.reconnecting(),
            reconnect_count: self.reconnect_count(),
            endpoint: self.endpoint().await,
            last_error: self.last_error().await,
            last_reconnect_reason: self.last_reconnect_reason().await,
        }
    }

    pub async fn to_json(&self) -> Value {
        self.snapshot().await.to_json()
    }
}

/// Serializable representation of [`StreamStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub healthy: bool,
    pub reconnecting: bool,
    pub reconnect_count: u64,
    pub endpoint: Option<String>,
    pub last_error: Option<String>,
    pub last_reconnect_reason: Option<String>,
}

impl StatusSnapshot {
    /// Renders the snapshot as a camelCase JSON object.
    pub fn to_json(&self) -> Value {
        let optional = |value: &Option<String>| match value {
            Some(text) => Value::String(text.clone()),
            None => Value::Null,
        };
        let mut map = Map::new();
        map.insert("healthy".into(), Value::Bool(self.healthy));
        map.insert("reconnecting".into(), Value::Bool(self.reconnecting));
        map.insert("reconnectCount".into(), Value::from(self.reconnect_count));
        map.insert("endpoint".into(), optional(&self.endpoint));
        map.insert("lastError".into(), optional(&self.last_error));
        map.insert(
            "lastReconnectReason".into(),
            optional(&self.last_reconnect_reason),
        );
        Value::Object(map)
    }
}
