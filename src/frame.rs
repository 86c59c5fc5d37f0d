//! The length-prefixed frame codec shared by both ends of the transport.
//!
//! Every gRPC-Web body is a sequence of frames: one byte of flags, a
//! four-byte big-endian payload length, then the payload. Message frames
//! carry codec-serialized messages; the final frame of a response sets the
//! trailers bit and carries an HTTP/1-style header block instead.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body::Body;
use pin_project::pin_project;
use tokio_stream::Stream;

use crate::error::{BoxError, ProtocolError};

/// Length of the flags + length prefix preceding every payload.
pub const HEADER_LEN: usize = 1 + 4;

/// MSB of the flags byte: the payload is a block of trailers.
pub const TRAILERS_BIT: u8 = 0b1000_0000;

/// LSB of the flags byte: the payload is compressed.
///
/// The bit is carried faithfully, but compression itself is not supported;
/// consumers reject frames that set it.
pub const COMPRESSED_BIT: u8 = 0b0000_0001;

const BUFFER_SIZE: usize = 8 * 1024;

/// A single decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether the trailers bit was set.
    pub trailers: bool,
    /// Whether the compressed bit was set.
    pub compressed: bool,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// An uncompressed message frame.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Frame {
            trailers: false,
            compressed: false,
            payload: payload.into(),
        }
    }

    /// An uncompressed trailers frame.
    pub fn trailers(payload: impl Into<Bytes>) -> Self {
        Frame {
            trailers: true,
            compressed: false,
            payload: payload.into(),
        }
    }

    /// Encode this frame, header plus payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        wrap(self.trailers, self.compressed, self.payload.clone())
    }
}

fn pack_flags(trailers: bool, compressed: bool) -> u8 {
    (u8::from(trailers) << 7) | u8::from(compressed)
}

fn unpack_flags(flags: u8) -> (bool, bool) {
    (flags & TRAILERS_BIT != 0, flags & COMPRESSED_BIT != 0)
}

/// Prefix `payload` with a frame header.
///
/// Fails only when the payload does not fit the four-byte length prefix.
pub fn wrap(
    trailers: bool,
    compressed: bool,
    payload: impl Into<Bytes>,
) -> Result<Bytes, ProtocolError> {
    let payload = payload.into();
    if payload.len() as u64 > u32::MAX as u64 {
        return Err(ProtocolError::FrameTooLong(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(pack_flags(trailers, compressed));
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Parse exactly one frame from the head of `buf`.
///
/// Bytes past the first frame are ignored. Fails with
/// [`ProtocolError::MalformedFrame`] when `buf` is shorter than the frame
/// it announces.
pub fn unwrap(buf: &[u8]) -> Result<Frame, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedFrame);
    }

    let (trailers, compressed) = unpack_flags(buf[0]);
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() - HEADER_LEN < len {
        return Err(ProtocolError::MalformedFrame);
    }

    Ok(Frame {
        trailers,
        compressed,
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + len]),
    })
}

#[derive(Debug)]
enum DecodeState {
    Header,
    Payload {
        trailers: bool,
        compressed: bool,
        len: usize,
    },
}

/// Incremental frame decoder over chunked input.
///
/// Feed arbitrary chunks with [`extend`](FrameDecoder::extend) and drain
/// complete frames with [`decode`](FrameDecoder::decode). Once a trailers
/// frame has been produced, remaining input is not decoded. Call
/// [`finish`](FrameDecoder::finish) at end of input to detect a source
/// that stopped mid-frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
    trailers_seen: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(BUFFER_SIZE),
            state: DecodeState::Header,
            trailers_seen: false,
        }
    }

    /// Append a chunk of input.
    pub fn extend(&mut self, chunk: &[u8]) {
        if !self.trailers_seen {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn decode(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.trailers_seen {
            return Ok(None);
        }

        if let DecodeState::Header = self.state {
            if self.buf.remaining() < HEADER_LEN {
                return Ok(None);
            }

            let (trailers, compressed) = unpack_flags(self.buf.get_u8());
            let len = self.buf.get_u32() as usize;
            self.buf.reserve(len.min(BUFFER_SIZE));
            self.state = DecodeState::Payload {
                trailers,
                compressed,
                len,
            };
        }

        if let DecodeState::Payload {
            trailers,
            compressed,
            len,
        } = self.state
        {
            if self.buf.remaining() < len {
                return Ok(None);
            }

            let payload = self.buf.split_to(len).freeze();
            self.state = DecodeState::Header;
            if trailers {
                self.trailers_seen = true;
                self.buf.clear();
            }

            return Ok(Some(Frame {
                trailers,
                compressed,
                payload,
            }));
        }

        Ok(None)
    }

    /// Whether a trailers frame has been produced.
    pub fn trailers_seen(&self) -> bool {
        self.trailers_seen
    }

    /// Check for leftover bytes after the source is exhausted.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.trailers_seen {
            return Ok(());
        }

        match self.state {
            DecodeState::Header if self.buf.is_empty() => Ok(()),
            _ => Err(ProtocolError::IncompleteStream),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

/// A lazy stream of frames read from an HTTP body.
///
/// Terminates after the first trailers frame; an underlying body failure
/// surfaces as [`ProtocolError::Transport`] and a body that ends mid-frame
/// as [`ProtocolError::IncompleteStream`]. The stream is fused after its
/// first error.
#[pin_project]
#[derive(Debug)]
pub struct FrameStream<B> {
    #[pin]
    body: B,
    decoder: FrameDecoder,
    body_done: bool,
    done: bool,
}

impl<B> FrameStream<B> {
    /// Decode frames from `body`.
    pub fn new(body: B) -> Self {
        FrameStream {
            body,
            decoder: FrameDecoder::new(),
            body_done: false,
            done: false,
        }
    }
}

impl<B> Stream for FrameStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Item = Result<Frame, ProtocolError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(None);
            }

            match this.decoder.decode() {
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Ok(None) => {}
                Err(err) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
            }

            if this.decoder.trailers_seen() {
                *this.done = true;
                return Poll::Ready(None);
            }

            if *this.body_done {
                *this.done = true;
                return match this.decoder.finish() {
                    Ok(()) => Poll::Ready(None),
                    Err(err) => Poll::Ready(Some(Err(err))),
                };
            }

            match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        this.decoder.extend(&data);
                    }
                }
                Some(Err(err)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(ProtocolError::Transport(err.into()))));
                }
                None => *this.body_done = true,
            }
        }
    }
}
