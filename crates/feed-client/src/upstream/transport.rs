//! Transport seam between the connection manager and the wire.
//!
//! The connection manager only sees [`Dialer`] and [`UpstreamConnection`]; the
//! gRPC implementation lives in [`super::grpc`] and tests plug in scripted
//! transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tonic::{Request, Status};

use crate::error::StreamError;
use crate::proto::{
    FeedWatchMessage, HandshakeRequest, HandshakeResponse, MessagingRequest, MessagingResponse,
    WatchRequest,
};

/// Server stream of feed messages opened by [`UpstreamConnection::watch`].
pub type EventStream = BoxStream<'static, Result<FeedWatchMessage, Status>>;

/// One established connection to an upstream endpoint.
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Endpoint the connection was dialed against.
    fn endpoint(&self) -> &str;

    async fn handshake(&self, request: Request<HandshakeRequest>)
        -> Result<HandshakeResponse, Status>;

    async fn watch(&self, request: Request<WatchRequest>) -> Result<EventStream, Status>;

    async fn messaging(
        &self,
        request: Request<MessagingRequest>,
    ) -> Result<MessagingResponse, Status>;

    /// Tears the connection down. Streams opened on it observe end-of-input.
    async fn close(&self) -> Result<(), Status>;
}

/// Opens connections to upstream endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `endpoint`, giving up after `timeout`.
    async fn dial(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn UpstreamConnection>, StreamError>;
}

/// Chooses the endpoint of the next dial attempt.
pub trait EndpointPicker: Send + Sync {
    fn pick_one(&self) -> Result<String, StreamError>;
}

/// Rotates over a static endpoint list.
#[derive(Debug)]
pub struct RoundRobinPicker {
    endpoints: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinPicker {
    pub fn new<I, S>(endpoints: I) -> Result<Self, StreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints.into_iter().map(Into::into).collect();
        if endpoints.is_empty() {
            return Err(StreamError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
        })
    }
}

impl EndpointPicker for RoundRobinPicker {
    fn pick_one(&self) -> Result<String, StreamError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints
            .get(index)
            .cloned()
            .ok_or(StreamError::NoEndpoints)
    }
}
