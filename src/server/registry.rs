//! Method descriptors and the ordered handler registry consulted at
//! dispatch time.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};

use crate::error::RpcError;
use crate::metadata::Metadata;
use crate::server::context::ServerContext;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A stream of serialized messages produced by a streaming handler.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Bytes, RpcError>> + Send>>;

type UnaryFn = Box<dyn Fn(Bytes, ServerContext) -> BoxFuture<Result<Bytes, RpcError>> + Send + Sync>;
type StreamingFn = Box<dyn Fn(Bytes, ServerContext) -> MessageStream + Send + Sync>;

pub(crate) enum RpcHandler {
    Unary(UnaryFn),
    ServerStreaming(StreamingFn),
    Unsupported,
}

struct MethodInner {
    path: String,
    request_streaming: bool,
    response_streaming: bool,
    handler: RpcHandler,
}

/// Immutable record of one RPC method: its path, streaming kinds, and the
/// erased handler plus serializers registered for it.
#[derive(Clone)]
pub struct MethodDescriptor {
    inner: Arc<MethodInner>,
}

impl MethodDescriptor {
    /// Register a unary method.
    ///
    /// `deserialize` and `serialize` are the opaque `bytes <-> message`
    /// transformers of the concrete codec; the engine never looks inside
    /// a message.
    pub fn unary<Req, Resp, D, S, H, Fut>(
        path: impl Into<String>,
        deserialize: D,
        serialize: S,
        handler: H,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Bytes) -> Result<Req, RpcError> + Send + Sync + 'static,
        S: Fn(Resp) -> Bytes + Send + Sync + 'static,
        H: Fn(Req, ServerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let serialize = Arc::new(serialize);
        let call: UnaryFn = Box::new(move |payload, ctx| {
            let serialize = serialize.clone();
            match deserialize(payload) {
                Ok(request) => {
                    let fut = handler(request, ctx);
                    Box::pin(async move { fut.await.map(|response| serialize(response)) })
                }
                Err(err) => Box::pin(std::future::ready(Err(err))),
            }
        });

        MethodDescriptor {
            inner: Arc::new(MethodInner {
                path: path.into(),
                request_streaming: false,
                response_streaming: false,
                handler: RpcHandler::Unary(call),
            }),
        }
    }

    /// Register a server-streaming method.
    pub fn server_streaming<Req, Resp, D, S, H, St>(
        path: impl Into<String>,
        deserialize: D,
        serialize: S,
        handler: H,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Bytes) -> Result<Req, RpcError> + Send + Sync + 'static,
        S: Fn(Resp) -> Bytes + Send + Sync + 'static,
        H: Fn(Req, ServerContext) -> St + Send + Sync + 'static,
        St: Stream<Item = Result<Resp, RpcError>> + Send + 'static,
    {
        let serialize = Arc::new(serialize);
        let call: StreamingFn = Box::new(move |payload, ctx| {
            let serialize = serialize.clone();
            match deserialize(payload) {
                Ok(request) => Box::pin(
                    handler(request, ctx).map(move |item| item.map(|response| serialize(response))),
                ),
                Err(err) => Box::pin(tokio_stream::once(Err(err))),
            }
        });

        MethodDescriptor {
            inner: Arc::new(MethodInner {
                path: path.into(),
                request_streaming: false,
                response_streaming: true,
                handler: RpcHandler::ServerStreaming(call),
            }),
        }
    }

    /// Register a client-streaming method.
    ///
    /// The transport cannot carry client streams in a single HTTP/1.1
    /// request; dispatch answers calls to this method with
    /// `UNIMPLEMENTED`.
    pub fn client_streaming(path: impl Into<String>) -> Self {
        MethodDescriptor {
            inner: Arc::new(MethodInner {
                path: path.into(),
                request_streaming: true,
                response_streaming: false,
                handler: RpcHandler::Unsupported,
            }),
        }
    }

    /// Register a bidirectional-streaming method. Answered with
    /// `UNIMPLEMENTED`, like [`client_streaming`](Self::client_streaming).
    pub fn bidi_streaming(path: impl Into<String>) -> Self {
        MethodDescriptor {
            inner: Arc::new(MethodInner {
                path: path.into(),
                request_streaming: true,
                response_streaming: true,
                handler: RpcHandler::Unsupported,
            }),
        }
    }

    /// The full method path, e.g. `/package.Service/Method`.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Whether the request side is a stream.
    pub fn request_streaming(&self) -> bool {
        self.inner.request_streaming
    }

    /// Whether the response side is a stream.
    pub fn response_streaming(&self) -> bool {
        self.inner.response_streaming
    }

    pub(crate) fn handler(&self) -> &RpcHandler {
        &self.inner.handler
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("path", &self.inner.path)
            .field("request_streaming", &self.inner.request_streaming)
            .field("response_streaming", &self.inner.response_streaming)
            .finish()
    }
}

/// What the registry knows about an incoming call when resolving it.
#[derive(Debug)]
pub struct CallDetails<'a> {
    method: &'a str,
    invocation_metadata: Option<&'a Metadata>,
}

impl<'a> CallDetails<'a> {
    /// Details for a call to `method`.
    pub fn new(method: &'a str, invocation_metadata: Option<&'a Metadata>) -> Self {
        CallDetails {
            method,
            invocation_metadata,
        }
    }

    /// The requested method path.
    pub fn method(&self) -> &str {
        self.method
    }

    /// The caller's metadata, when already decoded.
    pub fn invocation_metadata(&self) -> Option<&Metadata> {
        self.invocation_metadata
    }
}

/// A provider of method descriptors.
///
/// The registry probes handlers in registration order and dispatches on
/// the first one that claims the call.
pub trait GenericHandler: Send + Sync + 'static {
    /// Resolve `details` to a method descriptor, or decline with `None`.
    fn service(&self, details: &CallDetails<'_>) -> Option<MethodDescriptor>;
}

/// Ordered list of [`GenericHandler`]s.
///
/// Appends may happen while the server is taking traffic; lookups snapshot
/// the list, so a registration only affects subsequent requests.
pub struct ServiceRegistry {
    handlers: RwLock<Arc<Vec<Arc<dyn GenericHandler>>>>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ServiceRegistry {
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Append a handler. Earlier registrations win ties.
    pub fn add_handler(&self, handler: impl GenericHandler) {
        let mut guard = self.handlers.write().unwrap();
        let mut handlers = Vec::clone(&guard);
        handlers.push(Arc::new(handler));
        *guard = Arc::new(handlers);
    }

    /// Resolve a call by linear probe, first non-`None` wins.
    pub fn lookup(&self, details: &CallDetails<'_>) -> Option<MethodDescriptor> {
        let snapshot = self.handlers.read().unwrap().clone();
        snapshot.iter().find_map(|handler| handler.service(details))
    }

    fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        ServiceRegistry::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// A path -> descriptor table, the usual shape of one registered service.
#[derive(Debug, Default)]
pub struct ServiceDefinition {
    methods: HashMap<String, MethodDescriptor>,
}

impl ServiceDefinition {
    /// An empty definition.
    pub fn new() -> Self {
        ServiceDefinition::default()
    }

    /// Add a method. A descriptor already registered under the same path
    /// stays in place; the new one is ignored.
    pub fn add_method(mut self, descriptor: MethodDescriptor) -> Self {
        self.methods
            .entry(descriptor.path().to_owned())
            .or_insert(descriptor);
        self
    }
}

impl GenericHandler for ServiceDefinition {
    fn service(&self, details: &CallDetails<'_>) -> Option<MethodDescriptor> {
        self.methods.get(details.method()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_descriptor(path: &str, tag: &'static str) -> MethodDescriptor {
        MethodDescriptor::unary(
            path,
            |b: Bytes| Ok(b),
            move |_reply: Bytes| Bytes::from(tag),
            |req: Bytes, _ctx| async move { Ok(req) },
        )
    }

    #[test]
    fn first_registration_wins_across_handlers() {
        let registry = ServiceRegistry::new();
        registry.add_handler(
            ServiceDefinition::new().add_method(echo_descriptor("/test.Svc/Echo", "first")),
        );
        registry.add_handler(
            ServiceDefinition::new().add_method(echo_descriptor("/test.Svc/Echo", "second")),
        );

        let found = registry
            .lookup(&CallDetails::new("/test.Svc/Echo", None))
            .unwrap();
        assert_eq!(found.path(), "/test.Svc/Echo");
        // Two handlers registered, the earlier one resolves the call.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_paths_within_a_definition_keep_the_first() {
        let definition = ServiceDefinition::new()
            .add_method(MethodDescriptor::client_streaming("/test.Svc/Upload"))
            .add_method(echo_descriptor("/test.Svc/Upload", "shadowed"));

        let found = definition
            .service(&CallDetails::new("/test.Svc/Upload", None))
            .unwrap();
        assert!(found.request_streaming());
    }

    #[test]
    fn unknown_paths_resolve_to_none() {
        let registry = ServiceRegistry::new();
        registry.add_handler(
            ServiceDefinition::new().add_method(echo_descriptor("/test.Svc/Echo", "x")),
        );

        assert!(registry
            .lookup(&CallDetails::new("/test.Svc/Missing", None))
            .is_none());
    }

    #[test]
    fn streaming_kinds_are_recorded() {
        let unary = echo_descriptor("/t/U", "u");
        assert!(!unary.request_streaming() && !unary.response_streaming());

        let bidi = MethodDescriptor::bidi_streaming("/t/B");
        assert!(bidi.request_streaming() && bidi.response_streaming());
    }
}
