//! The HTTP user agent behind a channel.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::body::Body;
use crate::error::BoxError;

/// Future returned by [`Transport::request`].
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

/// An HTTP user agent a channel issues its calls through.
///
/// A request is always a `POST` with a fully buffered body of one frame;
/// the response body may stream. Implementations are expected to be
/// internally thread-safe and are shared across concurrent calls.
///
/// The default implementation is a pooled hyper client; tests and
/// in-process deployments can point a channel at a server directly by
/// implementing this trait over it.
pub trait Transport: Send + Sync + 'static {
    /// Issue one HTTP exchange.
    fn request(&self, req: Request<Full<Bytes>>) -> TransportFuture;
}

/// Connection-pooling transport over hyper.
pub(crate) struct PooledTransport {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl PooledTransport {
    pub(crate) fn new() -> Self {
        PooledTransport {
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }
}

impl Transport for PooledTransport {
    fn request(&self, req: Request<Full<Bytes>>) -> TransportFuture {
        let fut = self.client.request(req);
        Box::pin(async move {
            let response = fut.await.map_err(|err| Box::new(err) as BoxError)?;
            Ok(response.map(Body::new))
        })
    }
}

impl fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTransport").finish()
    }
}
