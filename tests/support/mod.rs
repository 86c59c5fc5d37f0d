//! Shared fixtures: a greeter service speaking a plain-UTF-8 "codec" and
//! an in-process transport that points a channel straight at a service.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Request;
use http_body_util::Full;

use grpcweb::{
    Code, GrpcWebService, Metadata, MethodDescriptor, RpcError, ServerContext, ServiceDefinition,
    Transport, TransportFuture, WebChannel,
};

pub fn encode(reply: String) -> Bytes {
    Bytes::from(reply)
}

pub fn encode_ref(request: &String) -> Bytes {
    Bytes::from(request.clone())
}

pub fn decode(raw: Bytes) -> Result<String, RpcError> {
    String::from_utf8(raw.to_vec()).map_err(|_| RpcError::unknown("message was not utf-8"))
}

fn greeting(name: &str) -> String {
    format!("Hello, {}!", name)
}

pub fn greeter_definition() -> ServiceDefinition {
    ServiceDefinition::new()
        .add_method(MethodDescriptor::unary(
            "/helloworld.Greeter/SayHello",
            decode,
            encode,
            |name: String, _ctx: ServerContext| async move { Ok(greeting(&name)) },
        ))
        .add_method(MethodDescriptor::server_streaming(
            "/helloworld.Greeter/SayHelloSlowly",
            decode,
            encode,
            |name: String, _ctx: ServerContext| {
                async_stream::stream! {
                    for ch in greeting(&name).chars() {
                        yield Ok(ch.to_string());
                    }
                }
            },
        ))
        .add_method(MethodDescriptor::unary(
            "/helloworld.Greeter/Abort",
            decode,
            encode,
            |_name: String, ctx: ServerContext| async move {
                Err::<String, _>(ctx.abort(Code::Aborted, "test aborting"))
            },
        ))
        .add_method(MethodDescriptor::server_streaming(
            "/helloworld.Greeter/AbortStream",
            decode,
            encode,
            |_name: String, ctx: ServerContext| {
                async_stream::stream! {
                    yield Ok("one".to_owned());
                    yield Ok("two".to_owned());
                    yield Err(ctx.abort(Code::Aborted, "stream aborted"));
                }
            },
        ))
        .add_method(MethodDescriptor::unary(
            "/helloworld.Greeter/Sleep",
            decode,
            encode,
            |name: String, _ctx: ServerContext| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(greeting(&name))
            },
        ))
        .add_method(MethodDescriptor::server_streaming(
            "/helloworld.Greeter/SleepyStream",
            decode,
            encode,
            |_name: String, _ctx: ServerContext| {
                async_stream::stream! {
                    for i in 0..5 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        yield Ok(format!("tick {}", i));
                    }
                }
            },
        ))
        .add_method(MethodDescriptor::unary(
            "/helloworld.Greeter/EchoMetadata",
            decode,
            encode,
            |name: String, ctx: ServerContext| async move {
                let as_internal = |err: grpcweb::ProtocolError| RpcError::internal(err.to_string());

                if let Some(value) = ctx
                    .invocation_metadata()
                    .get("x-grpc-test-echo-initial")
                    .and_then(|v| v.as_ascii())
                {
                    let mut initial = Metadata::new();
                    initial
                        .append_ascii("x-grpc-test-echo-initial", value)
                        .map_err(as_internal)?;
                    ctx.send_initial_metadata(initial)?;
                }

                if let Some(raw) = ctx
                    .invocation_metadata()
                    .get("x-grpc-test-echo-trailing-bin")
                    .and_then(|v| v.as_binary())
                {
                    let mut trailing = Metadata::new();
                    trailing
                        .append_binary("x-grpc-test-echo-trailing-bin", Bytes::copy_from_slice(raw))
                        .map_err(as_internal)?;
                    ctx.set_trailing_metadata(trailing);
                }

                Ok(greeting(&name))
            },
        ))
}

pub fn greeter_service() -> GrpcWebService {
    let service = GrpcWebService::new();
    service.add_handler(greeter_definition());
    service
}

/// Transport that short-circuits the network: every request is answered
/// by calling a service in process.
pub struct Loopback(pub GrpcWebService);

impl Transport for Loopback {
    fn request(&self, req: Request<Full<Bytes>>) -> TransportFuture {
        let mut service = self.0.clone();
        Box::pin(async move {
            let response = tower::Service::call(&mut service, req)
                .await
                .expect("service is infallible");
            Ok(response)
        })
    }
}

/// A channel wired straight to the greeter service.
pub fn greeter_channel() -> WebChannel {
    WebChannel::with_transport(
        Arc::new(Loopback(greeter_service())),
        "http://greeter.in-process".parse().unwrap(),
    )
}
