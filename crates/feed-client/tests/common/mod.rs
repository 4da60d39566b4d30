#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use feed_client::proto::{
    FeedWatchMessage, HandshakeRequest, HandshakeResponse, MessagingRequest, MessagingResponse,
    WatchRequest,
};
use feed_client::sfs::SideWatchPayload;
use feed_client::{
    Dialer, EndpointPicker, EventStream, FeedMessageType, ReleaseChangeEvent,
    ReleaseChangeHandler, RoundRobinPicker, SidecarIdentity, StreamError, UpstreamConnection,
    CURRENT_API_VERSION,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Status};

type Sender = mpsc::UnboundedSender<Result<FeedWatchMessage, Status>>;

#[derive(Debug, Clone)]
pub struct Delivered {
    pub generation: u64,
    pub kind: u32,
    pub body: Value,
}

#[derive(Default)]
struct Server {
    dials: AtomicUsize,
    generations: AtomicU64,
    closes: AtomicUsize,
    refuse_dials: AtomicUsize,
    dial_delay_ms: AtomicU64,
    refuse_messages: AtomicUsize,
    delivered: Mutex<Vec<Delivered>>,
    watches: Mutex<Vec<SideWatchPayload>>,
    streams: Mutex<Vec<Sender>>,
}

/// In-process feed server speaking through the crate's transport traits.
#[derive(Clone, Default)]
pub struct FakeFeed {
    server: Arc<Server>,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity() -> SidecarIdentity {
        SidecarIdentity::new(21, ["gateway", "billing"]).with_user("ops")
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(FakeDialer {
            server: self.server.clone(),
        })
    }

    pub fn picker(&self) -> Arc<dyn EndpointPicker> {
        Arc::new(RoundRobinPicker::new(["feed-a:9510", "feed-b:9510"]).unwrap())
    }

    pub fn dial_count(&self) -> usize {
        self.server.dials.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.server.closes.load(Ordering::SeqCst)
    }

    pub fn refuse_dials(&self, count: usize) {
        self.server.refuse_dials.store(count, Ordering::SeqCst);
    }

    pub fn slow_dials(&self, delay: Duration) {
        self.server
            .dial_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn refuse_messages(&self, count: usize) {
        self.server.refuse_messages.store(count, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.server.delivered.lock().unwrap().clone()
    }

    pub fn watches(&self) -> Vec<SideWatchPayload> {
        self.server.watches.lock().unwrap().clone()
    }

    /// Sends on the newest watch stream.
    pub fn send(&self, kind: FeedMessageType, body: Value) -> bool {
        let message = FeedWatchMessage {
            api_version: Some(CURRENT_API_VERSION.into()),
            rid: uuid::Uuid::new_v4().to_string(),
            r#type: kind.as_u32(),
            payload: serde_json::to_vec(&body).unwrap(),
        };
        self.server
            .streams
            .lock()
            .unwrap()
            .last()
            .is_some_and(|sender| sender.send(Ok(message)).is_ok())
    }
}

struct FakeDialer {
    server: Arc<Server>,
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(
        &self,
        endpoint: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn UpstreamConnection>, StreamError> {
        self.server.dials.fetch_add(1, Ordering::SeqCst);
        let delay = self.server.dial_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .server
            .refuse_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StreamError::Dial {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(Arc::new(FakeConnection {
            endpoint: endpoint.to_string(),
            generation: self.server.generations.fetch_add(1, Ordering::SeqCst) + 1,
            server: self.server.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

struct FakeConnection {
    endpoint: String,
    generation: u64,
    server: Arc<Server>,
    closed: CancellationToken,
}

impl FakeConnection {
    fn ensure_open(&self) -> Result<(), Status> {
        if self.closed.is_cancelled() {
            Err(Status::unavailable("connection closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn handshake(
        &self,
        _request: Request<HandshakeRequest>,
    ) -> Result<HandshakeResponse, Status> {
        self.ensure_open()?;
        Ok(HandshakeResponse {
            api_version: Some(CURRENT_API_VERSION.into()),
            payload: br#"{"serviceInfo":{"name":"feed","ip":"10.1.0.4"}}"#.to_vec(),
        })
    }

    async fn watch(&self, request: Request<WatchRequest>) -> Result<EventStream, Status> {
        self.ensure_open()?;
        let payload: SideWatchPayload = serde_json::from_slice(&request.get_ref().payload)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        self.server.watches.lock().unwrap().push(payload);

        let (sender, receiver) = mpsc::unbounded_channel();
        self.server.streams.lock().unwrap().push(sender);
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
        self.ensure_open()?;
        if self
            .server
            .refuse_messages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Status::unavailable("messaging refused"));
        }
        let request = request.into_inner();
        self.server.delivered.lock().unwrap().push(Delivered {
            generation: self.generation,
            kind: request.r#type,
            body: serde_json::from_slice(&request.payload).unwrap_or(Value::Null),
        });
        Ok(MessagingResponse {})
    }

    async fn close(&self) -> Result<(), Status> {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

/// Collects every release event it is handed.
#[derive(Default)]
pub struct Collector {
    events: Mutex<Vec<ReleaseChangeEvent>>,
}

impl Collector {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl ReleaseChangeHandler for Collector {
    async fn on_release_change(&self, event: &ReleaseChangeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
