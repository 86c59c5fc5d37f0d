//! Blocking facade over the channel, for callers without an async runtime.
//!
//! Each channel owns a private runtime and drives the async machinery
//! with `block_on`; one OS thread per in-flight call, observable behavior
//! identical to the async channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use tokio::runtime::{Builder as RuntimeBuilder, Runtime};
use tokio_stream::StreamExt;

use crate::client::{self, ResponseStream, Transport, UnaryStream, UnaryUnary, WebChannel};
use crate::error::RpcError;

/// Open a blocking channel to `target` over plain HTTP.
pub fn insecure_web_channel(target: &str) -> Result<BlockingWebChannel, RpcError> {
    Ok(BlockingWebChannel {
        channel: client::insecure_web_channel(target)?,
        runtime: Arc::new(new_runtime()?),
    })
}

fn new_runtime() -> Result<Runtime, RpcError> {
    RuntimeBuilder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .build()
        .map_err(|err| RpcError::internal(format!("failed to start runtime: {}", err)))
}

/// Blocking counterpart of [`WebChannel`].
pub struct BlockingWebChannel {
    // Field order matters: the channel must drop before the runtime.
    // Struct fields drop in declaration order.
    channel: WebChannel,
    runtime: Arc<Runtime>,
}

impl BlockingWebChannel {
    /// A blocking channel over a caller-supplied [`Transport`].
    pub fn with_transport(transport: Arc<dyn Transport>, origin: Uri) -> Result<Self, RpcError> {
        Ok(BlockingWebChannel {
            channel: WebChannel::with_transport(transport, origin),
            runtime: Arc::new(new_runtime()?),
        })
    }

    /// Blocking callable for a unary method.
    pub fn unary_unary<Req, Resp>(
        &self,
        path: impl Into<String>,
        serialize: impl Fn(&Req) -> bytes::Bytes + Send + Sync + 'static,
        deserialize: impl Fn(bytes::Bytes) -> Result<Resp, RpcError> + Send + Sync + 'static,
    ) -> BlockingUnaryUnary<Req, Resp> {
        BlockingUnaryUnary {
            inner: self.channel.unary_unary(path, serialize, deserialize),
            runtime: self.runtime.clone(),
        }
    }

    /// Blocking callable for a server-streaming method.
    pub fn unary_stream<Req, Resp>(
        &self,
        path: impl Into<String>,
        serialize: impl Fn(&Req) -> bytes::Bytes + Send + Sync + 'static,
        deserialize: impl Fn(bytes::Bytes) -> Result<Resp, RpcError> + Send + Sync + 'static,
    ) -> BlockingUnaryStream<Req, Resp> {
        BlockingUnaryStream {
            inner: self.channel.unary_stream(path, serialize, deserialize),
            runtime: self.runtime.clone(),
        }
    }
}

impl fmt::Debug for BlockingWebChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingWebChannel")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Blocking counterpart of [`UnaryUnary`].
pub struct BlockingUnaryUnary<Req, Resp> {
    inner: UnaryUnary<Req, Resp>,
    runtime: Arc<Runtime>,
}

impl<Req, Resp> BlockingUnaryUnary<Req, Resp> {
    /// Invoke the method once, blocking until the response arrives.
    pub fn call(&self, request: &Req, timeout: Option<Duration>) -> Result<Resp, RpcError> {
        self.runtime.block_on(self.inner.call(request, timeout))
    }
}

impl<Req, Resp> fmt::Debug for BlockingUnaryUnary<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingUnaryUnary")
            .field("inner", &self.inner)
            .finish()
    }
}

/// Blocking counterpart of [`UnaryStream`].
pub struct BlockingUnaryStream<Req, Resp> {
    inner: UnaryStream<Req, Resp>,
    runtime: Arc<Runtime>,
}

impl<Req, Resp> BlockingUnaryStream<Req, Resp>
where
    Resp: Send + 'static,
{
    /// Invoke the method once, blocking per message pulled.
    pub fn call(
        &self,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<BlockingResponseIter<Resp>, RpcError> {
        let stream = self.runtime.block_on(self.inner.call(request, timeout))?;
        Ok(BlockingResponseIter {
            stream,
            runtime: self.runtime.clone(),
        })
    }
}

impl<Req, Resp> fmt::Debug for BlockingUnaryStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingUnaryStream")
            .field("inner", &self.inner)
            .finish()
    }
}

/// Pull-style iterator over a server stream.
pub struct BlockingResponseIter<Resp> {
    // Stream first: it must drop before the runtime it was created on.
    stream: ResponseStream<Resp>,
    runtime: Arc<Runtime>,
}

impl<Resp> Iterator for BlockingResponseIter<Resp> {
    type Item = Result<Resp, RpcError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}

impl<Resp> fmt::Debug for BlockingResponseIter<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingResponseIter").finish()
    }
}
