//! Protobuf messages and client stub for the `feed.v1.Upstream` service.
//!
//! The service definition is small and stable, so the messages are declared
//! with `prost` derives and the client mirrors what `tonic-build` emits for
//! it. This keeps `protoc` out of the build.
//!
//! ```text
//! service Upstream {
//!   rpc Handshake(HandshakeRequest) returns (HandshakeResponse);
//!   rpc Watch(WatchRequest) returns (stream FeedWatchMessage);
//!   rpc Messaging(MessagingRequest) returns (MessagingResponse);
//! }
//! ```

use std::collections::HashMap;

/// Fully-qualified gRPC service name.
pub const SERVICE_NAME: &str = "feed.v1.Upstream";

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Versioning {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
    #[prost(uint32, tag = "3")]
    pub patch: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SidecarApp {
    #[prost(string, tag = "1")]
    pub app: String,
    #[prost(string, tag = "2")]
    pub uid: String,
    #[prost(map = "string, string", tag = "3")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SidecarSpec {
    #[prost(uint32, tag = "1")]
    pub biz_id: u32,
    #[prost(message, optional, tag = "2")]
    pub version: Option<Versioning>,
    #[prost(string, tag = "3")]
    pub namespace: String,
    #[prost(message, repeated, tag = "4")]
    pub apps: Vec<SidecarApp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeRequest {
    #[prost(message, optional, tag = "1")]
    pub api_version: Option<Versioning>,
    #[prost(message, optional, tag = "2")]
    pub spec: Option<SidecarSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeResponse {
    #[prost(message, optional, tag = "1")]
    pub api_version: Option<Versioning>,
    /// JSON encoded `HandshakePayload`.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchRequest {
    #[prost(message, optional, tag = "1")]
    pub api_version: Option<Versioning>,
    /// JSON encoded `SideWatchPayload`.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeedWatchMessage {
    #[prost(message, optional, tag = "1")]
    pub api_version: Option<Versioning>,
    #[prost(string, tag = "2")]
    pub rid: String,
    #[prost(uint32, tag = "3")]
    pub r#type: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessagingRequest {
    #[prost(uint32, tag = "1")]
    pub r#type: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct MessagingResponse {}

pub mod upstream_client {
    use tonic::codegen::*;

    use super::{
        FeedWatchMessage, HandshakeRequest, HandshakeResponse, MessagingRequest,
        MessagingResponse, WatchRequest, SERVICE_NAME,
    };

    /// Client stub for the `feed.v1.Upstream` service.
    #[derive(Debug, Clone)]
    pub struct UpstreamServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl<T> UpstreamServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })
        }

        pub async fn handshake(
            &mut self,
            request: impl tonic::IntoRequest<HandshakeRequest>,
        ) -> std::result::Result<tonic::Response<HandshakeResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/feed.v1.Upstream/Handshake");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(SERVICE_NAME, "Handshake"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn watch(
            &mut self,
            request: impl tonic::IntoRequest<WatchRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<FeedWatchMessage>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/feed.v1.Upstream/Watch");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(SERVICE_NAME, "Watch"));
            self.inner.server_streaming(req, path, codec).await
        }

        pub async fn messaging(
            &mut self,
            request: impl tonic::IntoRequest<MessagingRequest>,
        ) -> std::result::Result<tonic::Response<MessagingResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/feed.v1.Upstream/Messaging");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(SERVICE_NAME, "Messaging"));
            self.inner.unary(req, path, codec).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn feed_watch_message_survives_the_wire() {
        let message = FeedWatchMessage {
            api_version: Some(Versioning {
                major: 1,
                minor: 2,
                patch: 0,
            }),
            rid: "rid-7".into(),
            r#type: 2,
            payload: br#"{"kind":"push"}"#.to_vec(),
        };
        let decoded = FeedWatchMessage::decode(message.encode_to_vec().as_slice())
            .expect("message decodes");
        assert_eq!(decoded, message);
    }
}
