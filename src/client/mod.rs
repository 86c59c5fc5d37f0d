//! The client half: a channel that speaks gRPC-Web over HTTP/1.1.
//!
//! A [`WebChannel`] owns a pooled HTTP session and hands out per-method
//! callables. Unary and server-streaming methods are supported; the
//! streaming-request kinds cannot be carried by the transport and fail
//! with `UNIMPLEMENTED`.

pub mod blocking;

mod transport;

pub use transport::{Transport, TransportFuture};

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{header, HeaderMap, Request, Uri};
use http_body_util::{BodyExt, Full};
use tokio::time::{timeout_at, Instant};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::client::transport::PooledTransport;
use crate::error::{ProtocolError, RpcError};
use crate::frame::{self, FrameDecoder, FrameStream};
use crate::server::GRPC_WEB_CONTENT_TYPE;
use crate::timeout::serialize_timeout;
use crate::trailers::unpack_trailers;

const USER_AGENT: &str = concat!("grpc-web-rust/", env!("CARGO_PKG_VERSION"));

const CLIENT_TIMEOUT_DETAILS: &str = "request timed out at the client";

/// A stream of decoded response messages from a server-streaming call.
pub type ResponseStream<Resp> = Pin<Box<dyn Stream<Item = Result<Resp, RpcError>> + Send>>;

type SerializeFn<Req> = Arc<dyn Fn(&Req) -> Bytes + Send + Sync>;
type DeserializeFn<Resp> = Arc<dyn Fn(Bytes) -> Result<Resp, RpcError> + Send + Sync>;

/// Open a channel to `target` over plain HTTP.
///
/// A schemeless target gets `http://` prepended, matching what browser
/// clients do. The channel shares one connection pool across all calls
/// derived from it.
pub fn insecure_web_channel(target: &str) -> Result<WebChannel, RpcError> {
    let target = if target.contains("://") {
        target.to_owned()
    } else {
        format!("http://{}", target)
    };

    let origin: Uri = target
        .parse()
        .map_err(|err| RpcError::invalid_argument(format!("invalid channel target: {}", err)))?;
    if origin.scheme().is_none() || origin.authority().is_none() {
        return Err(RpcError::invalid_argument(format!(
            "channel target needs a scheme and authority: {}",
            target
        )));
    }

    Ok(WebChannel::with_transport(
        Arc::new(PooledTransport::new()),
        origin,
    ))
}

/// A client channel: one HTTP session plus the origin it points at.
#[derive(Clone)]
pub struct WebChannel {
    transport: Arc<dyn Transport>,
    origin: Uri,
}

impl WebChannel {
    /// A channel over a caller-supplied [`Transport`].
    pub fn with_transport(transport: Arc<dyn Transport>, origin: Uri) -> Self {
        WebChannel { transport, origin }
    }

    /// Callable for a unary method.
    pub fn unary_unary<Req, Resp>(
        &self,
        path: impl Into<String>,
        serialize: impl Fn(&Req) -> Bytes + Send + Sync + 'static,
        deserialize: impl Fn(Bytes) -> Result<Resp, RpcError> + Send + Sync + 'static,
    ) -> UnaryUnary<Req, Resp> {
        UnaryUnary {
            inner: CallInner {
                channel: self.clone(),
                path: path.into(),
                serialize: Arc::new(serialize),
                deserialize: Arc::new(deserialize),
            },
        }
    }

    /// Callable for a server-streaming method.
    pub fn unary_stream<Req, Resp>(
        &self,
        path: impl Into<String>,
        serialize: impl Fn(&Req) -> Bytes + Send + Sync + 'static,
        deserialize: impl Fn(Bytes) -> Result<Resp, RpcError> + Send + Sync + 'static,
    ) -> UnaryStream<Req, Resp> {
        UnaryStream {
            inner: CallInner {
                channel: self.clone(),
                path: path.into(),
                serialize: Arc::new(serialize),
                deserialize: Arc::new(deserialize),
            },
        }
    }

    /// Stub for a client-streaming method; every call fails with
    /// `UNIMPLEMENTED`.
    pub fn stream_unary(&self, path: impl Into<String>) -> NotImplementedMulticallable {
        NotImplementedMulticallable { path: path.into() }
    }

    /// Stub for a bidirectional-streaming method; every call fails with
    /// `UNIMPLEMENTED`.
    pub fn stream_stream(&self, path: impl Into<String>) -> NotImplementedMulticallable {
        NotImplementedMulticallable { path: path.into() }
    }
}

impl fmt::Debug for WebChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebChannel")
            .field("origin", &self.origin)
            .finish()
    }
}

struct CallInner<Req, Resp> {
    channel: WebChannel,
    path: String,
    serialize: SerializeFn<Req>,
    deserialize: DeserializeFn<Resp>,
}

impl<Req, Resp> Clone for CallInner<Req, Resp> {
    fn clone(&self) -> Self {
        CallInner {
            channel: self.channel.clone(),
            path: self.path.clone(),
            serialize: self.serialize.clone(),
            deserialize: self.deserialize.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for CallInner<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInner")
            .field("path", &self.path)
            .field("origin", &self.channel.origin)
            .finish()
    }
}

/// Per-method callable for unary RPCs.
#[derive(Clone)]
pub struct UnaryUnary<Req, Resp> {
    inner: CallInner<Req, Resp>,
}

impl<Req, Resp> UnaryUnary<Req, Resp> {
    /// Invoke the method once.
    ///
    /// The optional timeout bounds the whole exchange on the client and
    /// travels to the server as `grpc-timeout`. Returns the response
    /// message only when the effective `grpc-status` is zero.
    pub async fn call(&self, request: &Req, timeout: Option<Duration>) -> Result<Resp, RpcError> {
        let exchange = self.exchange(request, timeout);
        match deadline_after(timeout) {
            Some(deadline) => match timeout_at(deadline, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::deadline_exceeded(CLIENT_TIMEOUT_DETAILS)),
            },
            None => exchange.await,
        }
    }

    async fn exchange(&self, request: &Req, timeout: Option<Duration>) -> Result<Resp, RpcError> {
        let inner = &self.inner;
        let req = build_request(
            &inner.channel.origin,
            &inner.path,
            timeout,
            (inner.serialize)(request),
        )?;

        let response = inner
            .channel
            .transport
            .request(req)
            .await
            .map_err(|err| RpcError::unavailable(err.to_string()))?;
        let (parts, body) = response.into_parts();
        let header_status = status_from_headers(&parts.headers);

        let collected = BodyExt::collect(body)
            .await
            .map_err(|err| RpcError::unknown(err.to_string()))?
            .to_bytes();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&collected);

        let mut messages = Vec::new();
        let mut trailer_pairs = None;
        while let Some(decoded) = decoder.decode().map_err(client_protocol_error)? {
            if decoded.compressed {
                return Err(RpcError::unimplemented(
                    "compressed response frames are not supported",
                ));
            }
            if decoded.trailers {
                trailer_pairs =
                    Some(unpack_trailers(&decoded.payload).map_err(client_protocol_error)?);
            } else {
                messages.push(decoded.payload);
            }
        }
        decoder.finish().map_err(client_protocol_error)?;

        // Headers win when both carry a status; the trailer is the
        // fallback for servers that defer it to the body.
        let status = header_status
            .or_else(|| trailer_pairs.as_deref().and_then(status_from_pairs))
            .ok_or_else(|| RpcError::unknown("response carried no grpc-status"))?;
        status?;

        let mut messages = messages.into_iter();
        match (messages.next(), messages.next()) {
            (Some(message), None) => (inner.deserialize)(message),
            (None, _) => Err(RpcError::unknown("response carried no message frame")),
            (Some(_), Some(_)) => Err(RpcError::unknown(
                "unary response carried more than one message",
            )),
        }
    }
}

impl<Req, Resp> fmt::Debug for UnaryUnary<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryUnary").field("inner", &self.inner).finish()
    }
}

/// Per-method callable for server-streaming RPCs.
#[derive(Clone)]
pub struct UnaryStream<Req, Resp> {
    inner: CallInner<Req, Resp>,
}

impl<Req, Resp> UnaryStream<Req, Resp>
where
    Resp: Send + 'static,
{
    /// Invoke the method once, yielding the response messages as a
    /// stream.
    ///
    /// Messages arrive until the server's trailer frame, which closes the
    /// stream and surfaces any non-zero status as a final `Err` item.
    pub async fn call(
        &self,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<ResponseStream<Resp>, RpcError> {
        let inner = &self.inner;
        let deadline = deadline_after(timeout);
        let req = build_request(
            &inner.channel.origin,
            &inner.path,
            timeout,
            (inner.serialize)(request),
        )?;

        let response_fut = inner.channel.transport.request(req);
        let response = match deadline {
            Some(deadline) => match timeout_at(deadline, response_fut).await {
                Ok(response) => response,
                Err(_) => return Err(RpcError::deadline_exceeded(CLIENT_TIMEOUT_DETAILS)),
            },
            None => response_fut.await,
        }
        .map_err(|err| RpcError::unavailable(err.to_string()))?;

        let (parts, body) = response.into_parts();
        let header_ok = match status_from_headers(&parts.headers) {
            Some(Err(err)) => return Err(err),
            Some(Ok(())) => true,
            None => false,
        };

        let deserialize = inner.deserialize.clone();
        let mut frames = FrameStream::new(body);

        let stream = async_stream::stream! {
            let mut saw_trailers = false;

            loop {
                let next = match deadline {
                    Some(deadline) => match timeout_at(deadline, frames.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            yield Err(RpcError::deadline_exceeded(CLIENT_TIMEOUT_DETAILS));
                            return;
                        }
                    },
                    None => frames.next().await,
                };

                match next {
                    Some(Ok(decoded)) => {
                        if decoded.compressed {
                            yield Err(RpcError::unimplemented(
                                "compressed response frames are not supported",
                            ));
                            return;
                        }
                        if decoded.trailers {
                            saw_trailers = true;
                            match unpack_trailers(&decoded.payload) {
                                Ok(pairs) => match status_from_pairs(&pairs) {
                                    Some(Ok(())) => {}
                                    Some(Err(err)) => yield Err(err),
                                    None => {
                                        yield Err(RpcError::unknown(
                                            "trailers carried no grpc-status",
                                        ))
                                    }
                                },
                                Err(err) => yield Err(client_protocol_error(err)),
                            }
                            break;
                        }
                        match deserialize(decoded.payload) {
                            Ok(message) => yield Ok(message),
                            Err(err) => {
                                yield Err(err);
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        yield Err(client_protocol_error(err));
                        return;
                    }
                    None => break,
                }
            }

            if !saw_trailers && !header_ok {
                debug!("stream ended without trailers or a header status");
                yield Err(RpcError::unknown("incomplete stream"));
            }
        };

        Ok(Box::pin(stream))
    }
}

impl<Req, Resp> fmt::Debug for UnaryStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryStream").field("inner", &self.inner).finish()
    }
}

/// Stand-in for the RPC kinds the transport cannot carry.
#[derive(Debug, Clone)]
pub struct NotImplementedMulticallable {
    path: String,
}

impl NotImplementedMulticallable {
    /// Always fails with `UNIMPLEMENTED`.
    pub async fn call<Req, Resp>(
        &self,
        _request: &Req,
        _timeout: Option<Duration>,
    ) -> Result<Resp, RpcError> {
        Err(RpcError::unimplemented(format!(
            "{} uses a streaming request, which gRPC-Web cannot carry",
            self.path
        )))
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

fn build_request(
    origin: &Uri,
    path: &str,
    timeout: Option<Duration>,
    payload: Bytes,
) -> Result<Request<Full<Bytes>>, RpcError> {
    let path_and_query: PathAndQuery = path
        .parse()
        .map_err(|_| RpcError::invalid_argument(format!("invalid method path: {}", path)))?;

    let mut parts = origin.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    let uri = Uri::from_parts(parts)
        .map_err(|err| RpcError::invalid_argument(format!("invalid request uri: {}", err)))?;

    let encoded = frame::wrap(false, false, payload)
        .map_err(|err| RpcError::internal(err.to_string()))?;

    let mut builder = Request::post(uri)
        .header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
        .header(header::ACCEPT, GRPC_WEB_CONTENT_TYPE)
        .header("x-user-agent", USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.header("grpc-timeout", serialize_timeout(timeout));
    }

    builder
        .body(Full::new(encoded))
        .map_err(|err| RpcError::internal(err.to_string()))
}

/// Status read from response headers, when they carry one.
fn status_from_headers(headers: &HeaderMap) -> Option<Result<(), RpcError>> {
    let status = headers.get("grpc-status")?;
    Some(check_status(
        status.as_bytes(),
        headers.get("grpc-message").map(|value| value.as_bytes()),
    ))
}

/// Status read from decoded trailer pairs, when they carry one.
fn status_from_pairs(pairs: &[(String, String)]) -> Option<Result<(), RpcError>> {
    let status = pairs.iter().find(|(key, _)| key == "grpc-status")?;
    let message = pairs
        .iter()
        .find(|(key, _)| key == "grpc-message")
        .map(|(_, value)| value.as_bytes());
    Some(check_status(status.1.as_bytes(), message))
}

fn check_status(code: &[u8], message: Option<&[u8]>) -> Result<(), RpcError> {
    if code == b"0" {
        Ok(())
    } else {
        Err(RpcError::from_wire(code, message))
    }
}

fn client_protocol_error(err: ProtocolError) -> RpcError {
    match err {
        ProtocolError::Transport(err) => RpcError::unavailable(err.to_string()),
        ProtocolError::IncompleteStream => RpcError::unknown("incomplete stream"),
        other => RpcError::unknown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;

    #[test]
    fn schemeless_targets_default_to_http() {
        let channel = insecure_web_channel("localhost:8080").unwrap();
        assert_eq!(channel.origin.scheme_str(), Some("http"));

        let channel = insecure_web_channel("https://example.com").unwrap();
        assert_eq!(channel.origin.scheme_str(), Some("https"));

        assert!(insecure_web_channel("http://").is_err());
    }

    #[test]
    fn requests_carry_the_protocol_headers() {
        let origin: Uri = "http://localhost:9000".parse().unwrap();
        let req = build_request(
            &origin,
            "/test.Svc/Echo",
            Some(Duration::from_millis(100)),
            Bytes::from("payload"),
        )
        .unwrap();

        assert_eq!(req.method(), http::Method::POST);
        assert_eq!(req.uri().to_string(), "http://localhost:9000/test.Svc/Echo");
        assert_eq!(req.headers()[header::CONTENT_TYPE], GRPC_WEB_CONTENT_TYPE);
        assert_eq!(req.headers()["x-user-agent"], USER_AGENT);
        assert_eq!(req.headers()["grpc-timeout"], "100m");
    }

    #[test]
    fn header_status_parses_code_and_decodes_message() {
        let mut headers = HeaderMap::new();
        assert!(status_from_headers(&headers).is_none());

        headers.insert("grpc-status", "0".parse().unwrap());
        assert!(matches!(status_from_headers(&headers), Some(Ok(()))));

        headers.insert("grpc-status", "10".parse().unwrap());
        headers.insert("grpc-message", "test%20aborting".parse().unwrap());
        let err = status_from_headers(&headers).unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(err.details(), Some("test aborting"));
    }

    #[test]
    fn pair_status_uses_the_first_grpc_status_entry() {
        let pairs = vec![
            ("x-other".to_owned(), "ignored".to_owned()),
            ("grpc-status".to_owned(), "12".to_owned()),
        ];
        let err = status_from_pairs(&pairs).unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        assert!(status_from_pairs(&[]).is_none());
    }

    #[tokio::test]
    async fn streaming_request_stubs_fail_unimplemented() {
        let channel = insecure_web_channel("localhost:1").unwrap();
        let upload = channel.stream_unary("/test.Svc/Upload");
        let err = upload
            .call::<_, ()>(&"ignored", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }
}
