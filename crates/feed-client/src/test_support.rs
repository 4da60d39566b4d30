//! Scripted upstream transport shared by the unit tests.
//!
//! [`ScriptedUpstream`] plays the server side: it counts dials and closes,
//! records every messaging call and watch request, and lets a test push feed
//! messages into (or end) the most recent watch stream.

#![cfg(test)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Status};

use crate::error::StreamError;
use crate::proto::{
    FeedWatchMessage, HandshakeRequest, HandshakeResponse, MessagingRequest, MessagingResponse,
    WatchRequest,
};
use crate::sfs::{ApiVersion, FeedMessageType, SideWatchPayload, SidecarIdentity, CURRENT_API_VERSION};
use crate::upstream::transport::{
    Dialer, EndpointPicker, EventStream, RoundRobinPicker, UpstreamConnection,
};
use crate::upstream::{SIDE_META_METADATA_KEY, USER_METADATA_KEY};

type StreamSender = mpsc::UnboundedSender<Result<FeedWatchMessage, Status>>;

/// Messaging call observed by the scripted server.
#[derive(Debug, Clone)]
pub(crate) struct SentMessage {
    /// Generation of the connection the call arrived on.
    pub generation: u64,
    pub kind: u32,
    pub payload: Vec<u8>,
}

impl SentMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).expect("messaging payload is json")
    }
}

#[derive(Default)]
struct ScriptState {
    dial_attempts: AtomicUsize,
    connections: AtomicU64,
    closes: AtomicUsize,
    failing_dials: AtomicUsize,
    dial_delay_ms: AtomicU64,
    failing_messages: AtomicUsize,
    message_attempts: AtomicUsize,
    handshake: Mutex<Option<(ApiVersion, Vec<u8>)>>,
    messages: Mutex<Vec<SentMessage>>,
    watch_requests: Mutex<Vec<SideWatchPayload>>,
    streams: Mutex<Vec<StreamSender>>,
    metadata: Mutex<Option<(String, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the scripted server; clones share state.
#[derive(Clone, Default)]
pub(crate) struct ScriptedUpstream {
    state: Arc<ScriptState>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(&self) -> Arc<SidecarIdentity> {
        Arc::new(SidecarIdentity::new(7, ["gateway", "billing"]))
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(ScriptedDialer {
            state: self.state.clone(),
        })
    }

    pub fn picker(&self) -> Arc<dyn EndpointPicker> {
        Arc::new(RoundRobinPicker::new(["feed-1:9510", "feed-2:9510"]).expect("endpoints"))
    }

    /// Dial attempts, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.state.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.state
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_messages(&self, count: usize) {
        self.state.failing_messages.store(count, Ordering::SeqCst);
    }

    /// Messaging calls that reached the server, failed ones included.
    pub fn message_attempts(&self) -> usize {
        self.state.message_attempts.load(Ordering::SeqCst)
    }

    pub fn set_handshake(&self, version: ApiVersion, payload: &str) {
        *lock(&self.state.handshake) = Some((version, payload.as_bytes().to_vec()));
    }

    /// Successfully delivered messaging calls.
    pub fn messages(&self) -> Vec<SentMessage> {
        lock(&self.state.messages).clone()
    }

    pub fn watch_requests(&self) -> Vec<SideWatchPayload> {
        lock(&self.state.watch_requests).clone()
    }

    pub fn last_metadata(&self) -> Option<(String, String)> {
        lock(&self.state.metadata).clone()
    }

    /// Sends a message on the most recent watch stream.
    pub fn push(&self, message: FeedWatchMessage) -> bool {
        lock(&self.state.streams)
            .last()
            .map(|sender| sender.send(Ok(message)).is_ok())
            .unwrap_or(false)
    }

    /// Ends the most recent watch stream cleanly.
    pub fn end_stream(&self) {
        lock(&self.state.streams).pop();
    }

    /// Fails the most recent watch stream with `status`.
    pub fn break_stream(&self, status: Status) {
        if let Some(sender) = lock(&self.state.streams).pop() {
            let _ = sender.send(Err(status));
        }
    }
}

struct ScriptedDialer {
    state: Arc<ScriptState>,
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(
        &self,
        endpoint: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn UpstreamConnection>, StreamError> {
        self.state.dial_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.dial_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .state
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StreamError::Dial {
                endpoint: endpoint.to_string(),
                reason: "scripted failure".into(),
            });
        }
        let generation = self.state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ScriptedConnection {
            endpoint: endpoint.to_string(),
            generation,
            state: self.state.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

struct ScriptedConnection {
    endpoint: String,
    generation: u64,
    state: Arc<ScriptState>,
    closed: CancellationToken,
}

impl ScriptedConnection {
    fn check_open<T>(&self, request: &Request<T>) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            return Err(Status::unavailable("connection closed"));
        }
        let read = |key: &str| {
            request
                .metadata()
                .get(key)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        *lock(&self.state.metadata) =
            Some((read(USER_METADATA_KEY), read(SIDE_META_METADATA_KEY)));
        Ok(())
    }
}

#[async_trait]
impl UpstreamConnection for ScriptedConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn handshake(
        &self,
        request: Request<HandshakeRequest>,
    ) -> Result<HandshakeResponse, Status> {
        self.check_open(&request)?;
        let (version, payload) = lock(&self.state.handshake)
            .clone()
            .unwrap_or((CURRENT_API_VERSION, Vec::new()));
        Ok(HandshakeResponse {
            api_version: Some(version.into()),
            payload,
        })
    }

    async fn watch(&self, request: Request<WatchRequest>) -> Result<EventStream, Status> {
        self.check_open(&request)?;
        let payload: SideWatchPayload = serde_json::from_slice(&request.get_ref().payload)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        lock(&self.state.watch_requests).push(payload);

        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.state.streams).push(sender);
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream
            .take_until(self.closed.clone().cancelled_owned())
            .boxed())
    }

    async fn messaging(
        &self,
        request: Request<MessagingRequest>,
    ) -> Result<MessagingResponse, Status> {
        self.check_open(&request)?;
        self.state.message_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .state
            .failing_messages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Status::unavailable("scripted messaging failure"));
        }
        let request = request.into_inner();
        lock(&self.state.messages).push(SentMessage {
            generation: self.generation,
            kind: request.r#type,
            payload: request.payload,
        });
        Ok(MessagingResponse {})
    }

    async fn close(&self) -> Result<(), Status> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

/// Builds a feed message stamped with the current api version.
pub(crate) fn feed_message(kind: FeedMessageType, payload: Value) -> FeedWatchMessage {
    FeedWatchMessage {
        api_version: Some(CURRENT_API_VERSION.into()),
        rid: format!("rid-{}", kind.as_u32()),
        r#type: kind.as_u32(),
        payload: serde_json::to_vec(&payload).expect("payload encodes"),
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub(crate) async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
