//! HTTP body plumbing shared by the server and client halves.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use tokio::sync::mpsc;

use crate::error::BoxError;

/// Default queue depth between a streaming handler and the connection.
///
/// One in-flight frame keeps the disconnect race tight: the producer only
/// ever runs one message ahead of what the peer has accepted.
const CHANNEL_CAPACITY: usize = 1;

/// A type-erased HTTP body.
///
/// Responses produced by the server and bodies consumed by the client are
/// all carried as this one type: empty, fully buffered, streamed from a
/// handler task, or wrapping some foreign [`http_body::Body`].
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Channel(mpsc::Receiver<Result<Bytes, BoxError>>),
    Boxed(UnsyncBoxBody<Bytes, BoxError>),
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Body { kind: Kind::Empty }
    }

    /// A body holding a single chunk.
    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let kind = if data.is_empty() {
            Kind::Empty
        } else {
            Kind::Full(Some(data))
        };
        Body { kind }
    }

    /// Box a foreign body.
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Body {
            kind: Kind::Boxed(body.map_err(Into::into).boxed_unsync()),
        }
    }

    /// A body fed chunk by chunk from another task.
    ///
    /// The sender side observes disconnects: once this body is dropped,
    /// sends fail and [`mpsc::Sender::closed`] resolves.
    pub(crate) fn channel() -> (mpsc::Sender<Result<Bytes, BoxError>>, Body) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (tx, Body { kind: Kind::Channel(rx) })
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(data) => Poll::Ready(data.take().map(|b| Ok(Frame::data(b)))),
            Kind::Channel(rx) => match ready!(rx.poll_recv(cx)) {
                Some(Ok(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
                Some(Err(err)) => Poll::Ready(Some(Err(err))),
                None => Poll::Ready(None),
            },
            Kind::Boxed(inner) => Pin::new(inner).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty | Kind::Full(None) => true,
            Kind::Full(Some(_)) => false,
            Kind::Channel(_) => false,
            Kind::Boxed(inner) => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Empty | Kind::Full(None) => SizeHint::with_exact(0),
            Kind::Full(Some(data)) => SizeHint::with_exact(data.len() as u64),
            Kind::Channel(_) => SizeHint::default(),
            Kind::Boxed(inner) => inner.size_hint(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Empty => "Empty",
            Kind::Full(_) => "Full",
            Kind::Channel(_) => "Channel",
            Kind::Boxed(_) => "Boxed",
        };
        f.debug_struct("Body").field("kind", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body::Body as _;

    #[tokio::test]
    async fn full_body_yields_one_chunk() {
        let collected = BodyExt::collect(Body::full("payload")).await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from("payload"));
    }

    #[tokio::test]
    async fn empty_body_yields_nothing() {
        assert!(Body::empty().is_end_stream());
        let collected = BodyExt::collect(Body::empty()).await.unwrap();
        assert!(collected.to_bytes().is_empty());
    }

    #[tokio::test]
    async fn channel_body_streams_chunks_in_order() {
        let (tx, body) = Body::channel();

        tokio::spawn(async move {
            for chunk in ["a", "b", "c"] {
                tx.send(Ok(Bytes::from(chunk))).await.unwrap();
            }
        });

        let collected = BodyExt::collect(body).await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from("abc"));
    }

    #[tokio::test]
    async fn dropping_the_body_closes_the_sender() {
        let (tx, body) = Body::channel();
        drop(body);
        tx.closed().await;
        assert!(tx.send(Ok(Bytes::from("late"))).await.is_err());
    }
}
