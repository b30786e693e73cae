//! Minimal stand-up of a unary + server-streaming service against the
//! from-scratch runtime, exercising `ServerBuilder`/`ServiceBuilder`
//! directly rather than generated code. The message codec here is a
//! length-prefixed UTF-8 stand-in for a real Protocol Buffers codec
//!.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hotaru_grpc::prelude::*;

#[derive(Clone, Debug)]
struct HelloRequest {
    name: String,
}

#[derive(Clone, Debug)]
struct HelloResponse {
    message: String,
}

/// Encodes/decodes the two message types above by a trivial UTF-8 framing.
/// A production embedder would plug in a generated Protocol Buffers codec
/// here instead.
struct PlainTextCodec;

impl MessageCodec for PlainTextCodec {
    fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<BoxMessage, Status> {
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| Status::invalid_argument("payload was not valid UTF-8"))?;
        match type_name {
            "greeter.HelloRequest" => Ok(Box::new(HelloRequest { name: text })),
            other => Err(Status::unimplemented(format!("unknown message type: {other}"))),
        }
    }

    fn encode(&self, type_name: &str, message: &(dyn Any + Send + Sync)) -> Result<Bytes, Status> {
        match type_name {
            "greeter.HelloResponse" => {
                let response = message
                    .downcast_ref::<HelloResponse>()
                    .ok_or_else(|| Status::internal("unexpected message type"))?;
                Ok(Bytes::copy_from_slice(response.message.as_bytes()))
            }
            other => Err(Status::unimplemented(format!("unknown message type: {other}"))),
        }
    }
}

async fn say_hello(_ctx: RequestContext, request: HelloRequest) -> (HelloResponse, Status) {
    (
        HelloResponse {
            message: format!("hello, {}", request.name),
        },
        Status::ok(),
    )
}

async fn say_hello_repeatedly(
    _ctx: RequestContext,
    request: HelloRequest,
    sender: Sender<HelloResponse>,
) -> Status {
    for count in 1..=3 {
        let message = HelloResponse {
            message: format!("hello, {} ({count}/3)", request.name),
        };
        if sender.send(message).await.is_err() {
            return Status::cancelled("client went away");
        }
    }
    Status::ok()
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let greeter_service = ServiceBuilder::new("greeter.Greeter")
        .unary("SayHello", "greeter.HelloRequest", "greeter.HelloResponse", say_hello)
        .server_streaming(
            "SayHelloRepeatedly",
            "greeter.HelloRequest",
            "greeter.HelloResponse",
            say_hello_repeatedly,
        )
        .build();

    let server = ServerBuilder::new(Arc::new(PlainTextCodec))
        .register(greeter_service)
        .expect("service registration cannot fail on a fresh registry")
        .interceptor(Arc::new(RecoveryInterceptor { include_stack_trace: false }))
        .interceptor(Arc::new(TimeoutInterceptor::new(Some(Duration::from_secs(30)))))
        .build()
        .expect("server assembly cannot fail without TLS configured");

    let addr = server.start("127.0.0.1:50051".parse().unwrap()).await?;
    println!("greeter listening on {addr}");

    tokio::signal::ctrl_c().await?;
    server.stop(false, Duration::from_secs(10)).await
}
