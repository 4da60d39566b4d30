//! gRPC transport backed by `tonic`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::debug;

use super::transport::{Dialer, EventStream, UpstreamConnection};
use crate::config::TlsSettings;
use crate::error::StreamError;
use crate::proto::upstream_client::UpstreamServiceClient;
use crate::proto::{
    HandshakeRequest, HandshakeResponse, MessagingRequest, MessagingResponse, WatchRequest,
};

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Dials upstream endpoints over HTTP/2, optionally with TLS.
#[derive(Debug, Clone, Default)]
pub struct GrpcDialer {
    tls: Option<ClientTlsConfig>,
}

impl GrpcDialer {
    /// Plaintext dialer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dialer from optional TLS settings, loading the CA bundle eagerly.
    pub fn from_settings(tls: Option<&TlsSettings>) -> Result<Self, StreamError> {
        let Some(settings) = tls else {
            return Ok(Self::new());
        };
        let pem = std::fs::read(&settings.ca_file).map_err(|err| {
            StreamError::InvalidConfig(format!(
                "cannot read TLS CA bundle {}: {err}",
                settings.ca_file
            ))
        })?;
        let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
        if let Some(domain) = &settings.domain {
            config = config.domain_name(domain.clone());
        }
        Ok(Self { tls: Some(config) })
    }

    fn uri_for(&self, endpoint: &str) -> String {
        if endpoint.contains("://") {
            return endpoint.to_string();
        }
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{endpoint}")
    }

    fn endpoint(&self, endpoint: &str, timeout: Duration) -> Result<Endpoint, StreamError> {
        let dial_error = |reason: String| StreamError::Dial {
            endpoint: endpoint.to_string(),
            reason,
        };
        let mut builder = Endpoint::from_shared(self.uri_for(endpoint))
            .map_err(|err| dial_error(format!("invalid endpoint: {err}")))?
            .connect_timeout(timeout)
            .tcp_keepalive(Some(TCP_KEEPALIVE))
            .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);
        if let Some(tls) = &self.tls {
            builder = builder
                .tls_config(tls.clone())
                .map_err(|err| dial_error(format!("tls config error: {err}")))?;
        }
        Ok(builder)
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn UpstreamConnection>, StreamError> {
        let builder = self.endpoint(endpoint, timeout)?;
        let channel = match tokio::time::timeout(timeout, builder.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(err)) => {
                return Err(StreamError::Dial {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(StreamError::DialTimeout {
                    endpoint: endpoint.to_string(),
                    timeout,
                })
            }
        };
        debug!(endpoint, "grpc channel established");
        Ok(Arc::new(GrpcConnection {
            endpoint: endpoint.to_string(),
            client: UpstreamServiceClient::new(channel),
            closed: CancellationToken::new(),
        }))
    }
}

/// Connection over one `tonic` channel.
struct GrpcConnection {
    endpoint: String,
    client: UpstreamServiceClient<Channel>,
    /// Cancelled by `close`; ends every stream opened on this connection.
    closed: CancellationToken,
}

impl GrpcConnection {
    fn client(&self) -> Result<UpstreamServiceClient<Channel>, Status> {
        if self.closed.is_cancelled() {
            return Err(Status::unavailable("connection closed"));
        }
        Ok(self.client.clone())
    }
}

#[async_trait]
impl UpstreamConnection for GrpcConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn handshake(
        &self,
        request: Request<HandshakeRequest>,
    ) -> Result<HandshakeResponse, Status> {
        let response = self.client()?.handshake(request).await?;
        Ok(response.into_inner())
    }

    async fn watch(&self, request: Request<WatchRequest>) -> Result<EventStream, Status> {
        let stream = self.client()?.watch(request).await?.into_inner();
        Ok(stream
            .take_until(self.closed.clone().cancelled_owned())
            .boxed())
    }

    async fn messaging(
        &self,
        request: Request<MessagingRequest>,
    ) -> Result<MessagingResponse, Status> {
        let response = self.client()?.messaging(request).await?;
        Ok(response.into_inner())
    }

    async fn close(&self) -> Result<(), Status> {
        self.closed.cancel();
        Ok(())
    }
}
