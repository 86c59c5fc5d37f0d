//! gRPC-Web over plain HTTP/1.1.
//!
//! `grpcweb` carries gRPC semantics (method dispatch, length-prefixed
//! binary frames, status-code trailers, deadlines, metadata) over a
//! single HTTP `POST` per call, so browser and other HTTP-only clients
//! can reach gRPC services without HTTP/2 framing or trailer support.
//!
//! The crate is codec-agnostic: request and response messages pass through
//! as opaque `bytes <-> value` transformers supplied at registration, so
//! any Protocol Buffers implementation (or none at all) slots in.
//!
//! ## Serving
//!
//! [`GrpcWebService`] is a [`tower_service::Service`] over HTTP requests.
//! Register methods, then mount it on whatever HTTP/1.1 server the host
//! application runs:
//!
//! ```
//! use bytes::Bytes;
//! use grpcweb::{GrpcWebService, MethodDescriptor, ServiceDefinition};
//!
//! let service = GrpcWebService::new();
//! service.add_handler(ServiceDefinition::new().add_method(MethodDescriptor::unary(
//!     "/helloworld.Greeter/SayHello",
//!     |bytes: Bytes| Ok(bytes),
//!     |reply: Bytes| reply,
//!     |request: Bytes, _ctx| async move { Ok(request) },
//! )));
//! ```
//!
//! ## Calling
//!
//! [`insecure_web_channel`] opens a channel backed by a pooled HTTP
//! client; per-method callables do the rest:
//!
//! ```no_run
//! use bytes::Bytes;
//! use grpcweb::insecure_web_channel;
//!
//! # async fn call() -> Result<(), grpcweb::RpcError> {
//! let channel = insecure_web_channel("http://[::1]:50051")?;
//! let say_hello = channel.unary_unary(
//!     "/helloworld.Greeter/SayHello",
//!     |request: &Bytes| request.clone(),
//!     |reply: Bytes| Ok(reply),
//! );
//! let reply = say_hello.call(&Bytes::from("ping"), None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Limitations
//!
//! * Only unary and server-streaming calls exist on the wire; the
//!   streaming-request kinds are answered with `UNIMPLEMENTED`.
//! * The compressed-frame flag is decoded but compression itself is not
//!   supported; compressed frames are rejected.
//! * CORS support is the fixed preflight browsers need for gRPC-Web,
//!   nothing more.

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod body;
pub mod client;
pub mod frame;
pub mod server;
pub mod timeout;
pub mod trailers;

mod code;
mod error;
mod metadata;

pub use body::Body;
pub use client::{
    insecure_web_channel, NotImplementedMulticallable, ResponseStream, Transport, TransportFuture,
    UnaryStream, UnaryUnary, WebChannel,
};
pub use code::Code;
pub use error::{BoxError, ProtocolError, RpcError};
pub use metadata::{Metadata, MetadataValue};
pub use server::{
    CallDetails, GenericHandler, GrpcWebService, MessageStream, MethodDescriptor, ServerContext,
    ServiceDefinition, ServiceRegistry,
};
