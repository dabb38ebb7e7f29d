//! The gRPC / HTTP2 channel (§4.7.1's client side): a passthrough
//! `tonic::client::Grpc` built on the same [`RawCodec`] the server adapter
//! uses, so the framing is wire-identical in both directions.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::{Codec, Metadata, MetaValue, Model, Path, RpcError};
use conduit_transport_grpc::RawCodec;
use futures_util::StreamExt;
use tonic::transport::Channel as TonicChannel;
use tonic::{Code, Status};

use crate::model_codec::{decode_reply, encode_request};
use crate::stream::ReplyStream;
use crate::{Channel, ClientError};

pub struct GrpcChannel {
    inner: TonicChannel,
    codec: std::sync::Arc<dyn Codec>,
}

impl GrpcChannel {
    /// Connect (lazily -- `tonic`'s channel only dials on first use) to
    /// `endpoint`, e.g. `"http://127.0.0.1:50051"`.
    pub fn connect(endpoint: impl Into<String>, codec: std::sync::Arc<dyn Codec>) -> Result<Self, ClientError> {
        let endpoint = TonicChannel::from_shared(endpoint.into())
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        Ok(GrpcChannel { inner: endpoint.connect_lazy(), codec })
    }

    fn request<T>(&self, item: T, metadata: &Metadata, timeout: Option<Duration>) -> tonic::Request<T> {
        let mut req = tonic::Request::new(item);
        for (key, value) in metadata.iter() {
            if let Ok(key) = tonic::metadata::AsciiMetadataKey::from_bytes(key.as_bytes()) {
                if let Some(text) = meta_value_as_str(value) {
                    if let Ok(value) = text.parse() {
                        req.metadata_mut().insert(key, value);
                    }
                }
            }
        }
        if let Some(timeout) = timeout {
            req.set_timeout(timeout);
        }
        req
    }
}

fn meta_value_as_str(value: &MetaValue) -> Option<String> {
    match value {
        MetaValue::Str(s) => Some(s.clone()),
        MetaValue::Int(i) => Some(i.to_string()),
        MetaValue::Bool(b) => Some(b.to_string()),
    }
}

impl Channel for GrpcChannel {
    async fn unary_unary<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send,
    {
        let bytes = encode_request(self.codec.as_ref(), &request);
        let mut grpc = tonic::client::Grpc::new(self.inner.clone());
        grpc.ready().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let req = self.request(bytes, &metadata, timeout);
        let uri = grpc_path(path);
        let response = grpc
            .unary(req, uri, RawCodec)
            .await
            .map_err(status_to_client_error)?;
        decode_reply(self.codec.as_ref(), &response.into_inner()).map_err(ClientError::from)
    }

    async fn unary_stream<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send + 'static,
    {
        let bytes = encode_request(self.codec.as_ref(), &request);
        let mut grpc = tonic::client::Grpc::new(self.inner.clone());
        grpc.ready().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let req = self.request(bytes, &metadata, None);
        let uri = grpc_path(path);
        let response = grpc
            .server_streaming(req, uri, RawCodec)
            .await
            .map_err(status_to_client_error)?;
        let codec = self.codec.clone();
        let items = response.into_inner().map(move |item| match item {
            Ok(bytes) => decode_reply::<Rep>(codec.as_ref(), &bytes),
            Err(status) => Err(status_to_rpc_error(&status)),
        });
        Ok(ReplyStream::without_end_signal(Box::pin(items)))
    }

    async fn stream_unary<Req, Rep>(
        &self,
        path: &Path,
        requests: conduit_core::BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send,
    {
        let codec = self.codec.clone();
        let bytes_stream = requests.map(move |req| encode_request(codec.as_ref(), &req));
        let mut grpc = tonic::client::Grpc::new(self.inner.clone());
        grpc.ready().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let req = self.request(bytes_stream, &metadata, None);
        let uri = grpc_path(path);
        let response = grpc
            .client_streaming(req, uri, RawCodec)
            .await
            .map_err(status_to_client_error)?;
        decode_reply(self.codec.as_ref(), &response.into_inner()).map_err(ClientError::from)
    }

    async fn stream_stream<Req, Rep>(
        &self,
        path: &Path,
        requests: conduit_core::BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send + 'static,
    {
        let codec = self.codec.clone();
        let bytes_stream = requests.map(move |req| encode_request(codec.as_ref(), &req));
        let mut grpc = tonic::client::Grpc::new(self.inner.clone());
        grpc.ready().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let req = self.request(bytes_stream, &metadata, None);
        let uri = grpc_path(path);
        let response = grpc
            .streaming(req, uri, RawCodec)
            .await
            .map_err(status_to_client_error)?;
        let codec = self.codec.clone();
        let items = response.into_inner().map(move |item| match item {
            Ok(bytes) => decode_reply::<Rep>(codec.as_ref(), &bytes),
            Err(status) => Err(status_to_rpc_error(&status)),
        });
        Ok(ReplyStream::without_end_signal(Box::pin(items)))
    }
}

fn grpc_path(path: &Path) -> http::uri::PathAndQuery {
    path.as_str().parse().expect("endpoint path is always a valid gRPC PathAndQuery")
}

fn status_to_client_error(status: Status) -> ClientError {
    match status.code() {
        Code::Unavailable | Code::Unknown if status.message().is_empty() => {
            ClientError::Transport(status.to_string())
        }
        _ => ClientError::Rpc(status_to_rpc_error(&status)),
    }
}

/// The reverse of `conduit_transport_grpc::status::grpc_status_for`: there
/// is no way back to the original `field_violations` map once it has been
/// flattened into the status message, so a decoded `InvalidArgument` only
/// ever carries a single synthetic violation under `"*"`.
fn status_to_rpc_error(status: &Status) -> RpcError {
    match status.code() {
        Code::NotFound => RpcError::NotFound,
        Code::InvalidArgument => {
            let mut field_violations = BTreeMap::new();
            field_violations.insert("*".to_string(), status.message().to_string());
            RpcError::InvalidArgument { field_violations }
        }
        Code::Cancelled => RpcError::Cancelled,
        Code::DeadlineExceeded => RpcError::DeadlineExceeded,
        Code::Unauthenticated => RpcError::Unauthenticated,
        Code::PermissionDenied => RpcError::PermissionDenied,
        Code::Unavailable => RpcError::Unavailable,
        Code::Internal => RpcError::ServerError { message: Some(status.message().to_string()) },
        _ => RpcError::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_status_maps_back_to_not_found() {
        let status = Status::new(Code::NotFound, "not found");
        assert_eq!(status_to_rpc_error(&status), RpcError::NotFound);
    }

    #[test]
    fn invalid_argument_status_carries_the_flattened_message() {
        let status = Status::new(Code::InvalidArgument, "name: must not be empty");
        match status_to_rpc_error(&status) {
            RpcError::InvalidArgument { field_violations } => {
                assert_eq!(field_violations.get("*").map(String::as_str), Some("name: must not be empty"));
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }
}
