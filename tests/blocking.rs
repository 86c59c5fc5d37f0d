//! The blocking facade, driven without any ambient async runtime.

mod support;

use std::sync::Arc;

use grpcweb::client::blocking::BlockingWebChannel;
use grpcweb::Code;

use support::{decode, encode_ref, greeter_service, Loopback};

fn blocking_channel() -> BlockingWebChannel {
    BlockingWebChannel::with_transport(
        Arc::new(Loopback(greeter_service())),
        "http://greeter.in-process".parse().unwrap(),
    )
    .unwrap()
}

#[test]
fn unary_echo() {
    let channel = blocking_channel();
    let say_hello = channel.unary_unary("/helloworld.Greeter/SayHello", encode_ref, decode);

    let reply = say_hello.call(&"world".to_owned(), None).unwrap();
    assert_eq!(reply, "Hello, world!");
}

#[test]
fn streaming_pull_loop() {
    let channel = blocking_channel();
    let slowly = channel.unary_stream("/helloworld.Greeter/SayHelloSlowly", encode_ref, decode);

    let mut combined = String::new();
    let mut count = 0;
    for item in slowly.call(&"world".to_owned(), None).unwrap() {
        combined.push_str(&item.unwrap());
        count += 1;
    }

    assert_eq!(count, 13);
    assert_eq!(combined, "Hello, world!");
}

#[test]
fn abort_surfaces_synchronously() {
    let channel = blocking_channel();
    let abort = channel.unary_unary("/helloworld.Greeter/Abort", encode_ref, decode);

    let err = abort.call(&"world".to_owned(), None).unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(err.details(), Some("test aborting"));
}
