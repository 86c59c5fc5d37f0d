//! The server half: an HTTP service implementing the gRPC-Web protocol.
//!
//! [`GrpcWebService`] is a [`tower_service::Service`] over plain HTTP
//! requests. The host application owns the socket and mounts the service
//! wherever it serves HTTP/1.1; everything from method dispatch to trailer
//! encoding happens here.

mod context;
mod registry;

pub use context::ServerContext;
pub use registry::{
    CallDetails, GenericHandler, MessageStream, MethodDescriptor, ServiceDefinition,
    ServiceRegistry,
};

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::StreamExt;
use tower::ServiceExt;
use tower_service::Service;
use tracing::{debug, trace};

use crate::body::Body;
use crate::code::Code;
use crate::error::{encode_grpc_message, BoxError, ProtocolError, RpcError};
use crate::frame::{self, FrameStream};
use crate::metadata::Metadata;
use crate::server::registry::{BoxFuture, RpcHandler};
use crate::timeout::parse_timeout;
use crate::trailers::pack_trailers;

pub(crate) const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

const SERVER_TIMEOUT_DETAILS: &str = "request timed out at the server";

type FallbackFn = Arc<dyn Fn(Request<Body>) -> BoxFuture<Result<Response<Body>, BoxError>> + Send + Sync>;

/// HTTP entry point for registered gRPC-Web services.
///
/// Dispatches `POST`s to methods found in its [`ServiceRegistry`], answers
/// CORS preflights, and turns every protocol or handler failure into a
/// well-formed gRPC-Web response; the service itself never errors.
///
/// Handlers may keep registering after the service has started serving;
/// new registrations apply to subsequent requests.
#[derive(Clone)]
pub struct GrpcWebService {
    registry: Arc<ServiceRegistry>,
    fallback: Option<FallbackFn>,
}

impl GrpcWebService {
    /// A service with an empty registry and no fallback.
    pub fn new() -> Self {
        GrpcWebService {
            registry: Arc::new(ServiceRegistry::new()),
            fallback: None,
        }
    }

    /// Start building a service.
    pub fn builder() -> Builder {
        Builder { fallback: None }
    }

    /// The registry backing this service.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Append a handler to the registry.
    pub fn add_handler(&self, handler: impl GenericHandler) {
        self.registry.add_handler(handler);
    }
}

impl Default for GrpcWebService {
    fn default() -> Self {
        GrpcWebService::new()
    }
}

impl fmt::Debug for GrpcWebService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcWebService")
            .field("registry", &self.registry)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Builder for [`GrpcWebService`].
#[derive(Default)]
pub struct Builder {
    fallback: Option<FallbackFn>,
}

impl Builder {
    /// Delegate requests for unregistered paths to another HTTP service
    /// instead of answering 404.
    pub fn fallback<S>(mut self, service: S) -> Self
    where
        S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + Sync + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.fallback = Some(Arc::new(move |req| {
            let service = service.clone();
            Box::pin(async move { service.oneshot(req).await.map_err(Into::into) })
        }));
        self
    }

    /// Finish the build.
    pub fn build(self) -> GrpcWebService {
        GrpcWebService {
            registry: Arc::new(ServiceRegistry::new()),
            fallback: self.fallback,
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<B> Service<Request<B>> for GrpcWebService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let registry = self.registry.clone();
        let fallback = self.fallback.clone();
        let req = req.map(Body::new);
        Box::pin(async move { Ok(handle(registry, fallback, req).await) })
    }
}

async fn handle(
    registry: Arc<ServiceRegistry>,
    fallback: Option<FallbackFn>,
    req: Request<Body>,
) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        trace!(path = ?req.uri().path(), "cors preflight");
        return preflight_response();
    }

    let path = req.uri().path().to_owned();
    let Some(method) = registry.lookup(&CallDetails::new(&path, None)) else {
        return match fallback {
            Some(fallback) => {
                debug!(path = %path, "no method registered, delegating to fallback");
                fallback(req).await.unwrap_or_else(|err| {
                    debug!("fallback service failed: {}", err);
                    plain_response(StatusCode::INTERNAL_SERVER_ERROR)
                })
            }
            None => {
                debug!(path = %path, "no method registered");
                plain_response(StatusCode::NOT_FOUND)
            }
        };
    };

    if req.method() != Method::POST {
        debug!(method = ?req.method(), path = %path, "only POST carries calls");
        return plain_response(StatusCode::BAD_REQUEST);
    }

    let ctx = match build_context(req.headers()) {
        Ok(ctx) => ctx,
        Err(err) => {
            debug!(path = %path, "rejecting request headers: {}", err);
            return error_response(&RpcError::invalid_argument(err.to_string()));
        }
    };

    if method.request_streaming() {
        debug!(path = %path, "request-streaming call rejected");
        return error_response(&RpcError::unimplemented(
            "request-streaming calls are not supported over gRPC-Web",
        ));
    }

    trace!(path = %path, streaming = method.response_streaming(), "dispatching call");
    let body = req.into_body();

    match method.handler() {
        RpcHandler::Unary(_) => unary_call(&method, body, ctx).await,
        RpcHandler::ServerStreaming(_) => streaming_call(&method, body, ctx).await,
        RpcHandler::Unsupported => error_response(&RpcError::unimplemented(
            "method is not supported over gRPC-Web",
        )),
    }
}

/// Turn the request headers into per-call state: `grpc-timeout` becomes
/// the deadline, everything else becomes invocation metadata.
fn build_context(headers: &HeaderMap) -> Result<ServerContext, ProtocolError> {
    let mut timeout = None;
    let mut metadata = Metadata::new();

    for (name, value) in headers {
        if name.as_str() == "grpc-timeout" {
            if timeout.is_none() {
                timeout = Some(parse_timeout(value.as_bytes())?);
            }
        } else {
            metadata.append_from_wire(name.as_str(), value.as_bytes())?;
        }
    }

    // A timeout too large to represent as an instant is as good as none.
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    Ok(ServerContext::new(deadline, metadata))
}

/// Read the single message frame of a non-streaming request, draining the
/// body to its end.
async fn read_unary_request(frames: &mut FrameStream<Body>) -> Result<Bytes, RpcError> {
    let mut message = None;

    while let Some(item) = frames.next().await {
        let frame = item.map_err(|err| RpcError::invalid_argument(err.to_string()))?;

        if frame.compressed {
            return Err(RpcError::unimplemented(
                "compressed request frames are not supported",
            ));
        }
        if frame.trailers {
            return Err(RpcError::failed_precondition(
                "unexpected trailers frame in a unary request",
            ));
        }
        if message.is_some() {
            return Err(RpcError::failed_precondition(
                "unary request carried more than one message",
            ));
        }

        message = Some(frame.payload);
    }

    message.ok_or_else(|| RpcError::invalid_argument("request body carried no message frame"))
}

async fn unary_call(method: &MethodDescriptor, body: Body, ctx: ServerContext) -> Response<Body> {
    let mut frames = FrameStream::new(body);
    let payload = match read_unary_request(&mut frames).await {
        Ok(payload) => payload,
        Err(err) => return error_response(&err),
    };

    let RpcHandler::Unary(call) = method.handler() else {
        return error_response(&RpcError::internal("handler kind mismatch"));
    };

    let fut = call(payload, ctx.clone());
    let outcome = match ctx.deadline() {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(outcome) => outcome,
            Err(_) => {
                ctx.set_code(Code::DeadlineExceeded);
                ctx.set_details(SERVER_TIMEOUT_DETAILS);
                return unary_response(&ctx, None);
            }
        },
        None => fut.await,
    };

    match outcome {
        Ok(message) => unary_response(&ctx, Some(message)),
        Err(err) => {
            ctx.record_error(&err);
            unary_response(&ctx, None)
        }
    }
}

/// Buffered unary response: status mirrored in headers, body of at most
/// one message frame plus a trailer frame when trailing metadata is set.
fn unary_response(ctx: &ServerContext, message: Option<Bytes>) -> Response<Body> {
    let code = ctx.code();
    let details = ctx.details();

    let mut builder = status_headers(response_parts(code.http_status()), code, details.as_deref());
    if let Some(md) = ctx.take_initial_metadata() {
        builder = metadata_headers(builder, &md);
    }

    let mut body = BytesMut::new();
    if let Some(message) = message {
        match frame::wrap(false, false, message) {
            Ok(encoded) => body.extend_from_slice(&encoded),
            Err(err) => return error_response(&RpcError::internal(err.to_string())),
        }
    }
    if let Some(trailing) = ctx.trailing_metadata() {
        match encode_trailer_frame(code, details.as_deref(), Some(&trailing)) {
            Ok(encoded) => body.extend_from_slice(&encoded),
            Err(err) => return error_response(&RpcError::internal(err.to_string())),
        }
    }

    builder = builder.header(header::CONTENT_LENGTH, body.len());
    finalize(builder, Body::full(body.freeze()))
}

async fn streaming_call(
    method: &MethodDescriptor,
    body: Body,
    ctx: ServerContext,
) -> Response<Body> {
    let mut frames = FrameStream::new(body);
    let payload = match read_unary_request(&mut frames).await {
        Ok(payload) => payload,
        Err(err) => return error_response(&err),
    };

    let RpcHandler::ServerStreaming(call) = method.handler() else {
        return error_response(&RpcError::internal("handler kind mismatch"));
    };

    let mut stream = call(payload, ctx.clone());
    let deadline = ctx.deadline();

    // Drive the handler to its first message before the response starts:
    // initial metadata and failures that happen up front belong in the
    // response headers.
    let first = match next_message(&mut stream, deadline).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(err))) => {
            ctx.record_error(&err);
            return trailer_only_response(&ctx);
        }
        Ok(None) => return trailer_only_response(&ctx),
        Err(_) => {
            ctx.set_code(Code::DeadlineExceeded);
            ctx.set_details(SERVER_TIMEOUT_DETAILS);
            return trailer_only_response(&ctx);
        }
    };

    let mut builder = response_parts(ctx.code().http_status());
    if let Some(md) = ctx.take_initial_metadata() {
        builder = metadata_headers(builder, &md);
    }

    let (tx, response_body) = Body::channel();
    tokio::spawn(pump_stream(stream, first, tx, ctx, deadline));

    finalize(builder, response_body)
}

/// Feed message frames from the handler stream into the response body,
/// racing every step against a client disconnect, and finish with exactly
/// one trailer frame.
async fn pump_stream(
    mut stream: MessageStream,
    first: Bytes,
    tx: mpsc::Sender<Result<Bytes, BoxError>>,
    ctx: ServerContext,
    deadline: Option<Instant>,
) {
    let mut failed = false;
    match frame::wrap(false, false, first) {
        Ok(encoded) => {
            if tx.send(Ok(encoded)).await.is_err() {
                return;
            }
        }
        Err(err) => {
            ctx.record_error(&RpcError::internal(err.to_string()));
            failed = true;
        }
    }

    while !failed && !ctx.is_aborted() {
        tokio::select! {
            _ = tx.closed() => {
                trace!("client disconnected, cancelling stream");
                return;
            }
            next = next_message(&mut stream, deadline) => match next {
                Ok(Some(Ok(message))) => {
                    let encoded = match frame::wrap(false, false, message) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            ctx.record_error(&RpcError::internal(err.to_string()));
                            break;
                        }
                    };
                    if tx.send(Ok(encoded)).await.is_err() {
                        return;
                    }
                }
                Ok(Some(Err(err))) => {
                    ctx.record_error(&err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    ctx.set_code(Code::DeadlineExceeded);
                    ctx.set_details(SERVER_TIMEOUT_DETAILS);
                    break;
                }
            }
        }
    }

    // Cancel any user work still pending behind the stream.
    drop(stream);

    match encode_trailer_frame(
        ctx.code(),
        ctx.details().as_deref(),
        ctx.trailing_metadata().as_ref(),
    ) {
        Ok(trailer) => {
            let _ = tx.send(Ok(trailer)).await;
        }
        Err(err) => debug!("failed to encode trailers: {}", err),
    }
}

async fn next_message(
    stream: &mut MessageStream,
    deadline: Option<Instant>,
) -> Result<Option<Result<Bytes, RpcError>>, tokio::time::error::Elapsed> {
    match deadline {
        Some(deadline) => timeout_at(deadline, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Streaming response that carries no messages: headers mirror the status
/// and the body is a single trailer frame.
fn trailer_only_response(ctx: &ServerContext) -> Response<Body> {
    let code = ctx.code();
    let details = ctx.details();

    let mut builder = status_headers(response_parts(code.http_status()), code, details.as_deref());
    if let Some(md) = ctx.take_initial_metadata() {
        builder = metadata_headers(builder, &md);
    }

    match encode_trailer_frame(code, details.as_deref(), ctx.trailing_metadata().as_ref()) {
        Ok(trailer) => {
            builder = builder.header(header::CONTENT_LENGTH, trailer.len());
            finalize(builder, Body::full(trailer))
        }
        Err(err) => error_response(&RpcError::internal(err.to_string())),
    }
}

fn encode_trailer_frame(
    code: Code,
    details: Option<&str>,
    trailing_metadata: Option<&Metadata>,
) -> Result<Bytes, ProtocolError> {
    let mut pairs = vec![("grpc-status".to_owned(), code.as_str().to_owned())];
    if let Some(details) = details {
        if !details.is_empty() {
            pairs.push(("grpc-message".to_owned(), encode_grpc_message(details)));
        }
    }
    if let Some(metadata) = trailing_metadata {
        pairs.extend(metadata.to_wire_pairs());
    }

    frame::wrap(true, false, pack_trailers(&pairs)?)
}

/// Base response: content type plus the CORS headers every non-preflight
/// response carries.
fn response_parts(status: StatusCode) -> http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*")
}

fn status_headers(
    builder: http::response::Builder,
    code: Code,
    details: Option<&str>,
) -> http::response::Builder {
    let mut builder = builder.header("grpc-status", code.as_str());
    if let Some(details) = details {
        if !details.is_empty() {
            builder = builder.header("grpc-message", encode_grpc_message(details));
        }
    }
    builder
}

fn metadata_headers(
    mut builder: http::response::Builder,
    metadata: &Metadata,
) -> http::response::Builder {
    for (key, value) in metadata.to_wire_pairs() {
        builder = builder.header(key, value);
    }
    builder
}

/// Headers-only failure response; the status pair doubles as the trailer.
fn error_response(err: &RpcError) -> Response<Body> {
    let builder = status_headers(
        response_parts(err.code().http_status()),
        err.code(),
        err.details(),
    );
    finalize(builder.header(header::CONTENT_LENGTH, 0), Body::empty())
}

fn plain_response(status: StatusCode) -> Response<Body> {
    let builder = Response::builder()
        .status(status)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*");
    finalize(builder, Body::empty())
}

fn preflight_response() -> Response<Body> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, 0)
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS")
        .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true")
        .header(header::ACCESS_CONTROL_EXPOSE_HEADERS, "*");
    finalize(builder, Body::empty())
}

fn finalize(builder: http::response::Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|err| {
        debug!("failed to assemble response: {}", err);
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(header::CONTENT_TYPE, GRPC_WEB_CONTENT_TYPE)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn preflight_carries_the_fixed_cors_headers() {
        let mut svc = GrpcWebService::new();
        let res = svc.call(request(Method::OPTIONS, "/any.Svc/Method")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let headers = res.headers();
        assert_eq!(headers["access-control-allow-methods"], "POST, OPTIONS");
        assert_eq!(headers["access-control-allow-headers"], "*");
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert_eq!(headers["access-control-expose-headers"], "*");
        assert_eq!(headers[header::CONTENT_LENGTH], "0");
    }

    #[tokio::test]
    async fn unknown_path_without_fallback_is_404() {
        let mut svc = GrpcWebService::new();
        let res = svc.call(request(Method::POST, "/no.Such/Method")).await.unwrap();

        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn non_post_on_a_registered_path_is_400() {
        let svc = GrpcWebService::new();
        svc.add_handler(ServiceDefinition::new().add_method(MethodDescriptor::unary(
            "/test.Svc/Echo",
            |b: Bytes| Ok(b),
            |b: Bytes| b,
            |req: Bytes, _ctx| async move { Ok(req) },
        )));

        for method in [Method::GET, Method::PUT, Method::DELETE, Method::PATCH] {
            let mut svc = svc.clone();
            let res = svc.call(request(method.clone(), "/test.Svc/Echo")).await.unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{}", method);
        }
    }

    #[tokio::test]
    async fn unknown_path_with_fallback_delegates() {
        #[derive(Clone)]
        struct StaticOk;

        impl Service<Request<Body>> for StaticOk {
            type Response = Response<Body>;
            type Error = Infallible;
            type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

            fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, _: Request<Body>) -> Self::Future {
                std::future::ready(Ok(Response::new(Body::full("fallback"))))
            }
        }

        let mut svc = GrpcWebService::builder().fallback(StaticOk).build();
        let res = svc.call(request(Method::POST, "/not.Grpc/AtAll")).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let collected = http_body_util::BodyExt::collect(res.into_body()).await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from("fallback"));
    }

    #[tokio::test]
    async fn invalid_timeout_header_is_rejected_up_front() {
        let svc = GrpcWebService::new();
        svc.add_handler(ServiceDefinition::new().add_method(MethodDescriptor::unary(
            "/test.Svc/Echo",
            |b: Bytes| Ok(b),
            |b: Bytes| b,
            |req: Bytes, _ctx| async move { Ok(req) },
        )));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/test.Svc/Echo")
            .header("grpc-timeout", "bogus")
            .body(Body::empty())
            .unwrap();

        let res = svc.clone().call(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(res.headers()["grpc-status"], Code::InvalidArgument.as_str());
    }
}
