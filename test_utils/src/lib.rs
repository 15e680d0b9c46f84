//! Helpers shared by grpcannon's integration tests: canned method descriptions and a fake gRPC
//! service which answers every call by invoking a callback instead of using the network.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{FutureExt, future::BoxFuture, stream};
use grpcannon::{MethodDescriptor, MethodDescriptorBuilder};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, StreamBody};
use http_body_util::combinators::BoxBody;
use std::{
    error::Error,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{Code, Status, metadata::GRPC_CONTENT_TYPE};
use tower::Service;

pub const GREETER_PATH: &str = "/helloworld.Greeter/SayHello";

/// Description of the classic `helloworld.Greeter/SayHello` unary method
pub fn greeter_method() -> MethodDescriptor {
    MethodDescriptorBuilder::default()
        .fully_qualified_name("helloworld.Greeter.SayHello")
        .name("SayHello")
        .service_name("Greeter")
        .input_name("HelloRequest")
        .output_name("HelloReply")
        .build()
        .expect("greeter method is valid")
}

/// gRPC request as seen by a callback
pub struct GrpcRequest {
    /// Fully qualified gRPC service name
    pub service: String,
    /// RPC name
    pub rpc: String,
    pub headers: HeaderMap,
    /// The whole request body, still framed
    pub body: Bytes,
}

/// What the fake service should answer with
#[derive(Clone, Debug)]
pub struct CannedResponse {
    messages: Vec<Bytes>,
    code: Code,
    message: String,
    trailers_only: bool,
}

impl CannedResponse {
    /// Successful response carrying the given encoded messages
    pub fn ok(messages: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
            code: Code::Ok,
            message: String::new(),
            trailers_only: false,
        }
    }

    /// Response carrying the given messages whose trailers report a failure
    pub fn failed_after(messages: impl IntoIterator<Item = Bytes>, code: Code, msg: &str) -> Self {
        Self {
            code,
            message: msg.to_owned(),
            ..Self::ok(messages)
        }
    }

    /// Failure reported in the response headers with no body, as servers do for calls they reject
    /// outright
    pub fn trailers_only(code: Code, msg: &str) -> Self {
        Self {
            messages: vec![],
            code,
            message: msg.to_owned(),
            trailers_only: true,
        }
    }

    fn status_headers(&self) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from(self.code as i32));
        if !self.message.is_empty() {
            headers.insert("grpc-message", HeaderValue::from_str(&self.message)?);
        }
        Ok(headers)
    }

    fn into_http(self) -> anyhow::Result<Response<CannedBody>> {
        let mut resp_builder = Response::builder()
            .status(200)
            .header(http::header::CONTENT_TYPE, GRPC_CONTENT_TYPE);
        let mut frames: Vec<Result<Frame<Bytes>, Status>> = vec![];
        if self.trailers_only {
            for (k, v) in self.status_headers()?.iter() {
                resp_builder = resp_builder.header(k, v);
            }
        } else {
            for msg in &self.messages {
                // Compression flag, then 32-bit length, then the actual message
                let mut framed = BytesMut::with_capacity(5 + msg.len());
                framed.put_u8(0);
                framed.put_u32(msg.len() as u32);
                framed.put_slice(msg);
                frames.push(Ok(Frame::data(framed.freeze())));
            }
            frames.push(Ok(Frame::trailers(self.status_headers()?)));
        }
        let body = BoxBody::new(StreamBody::new(stream::iter(frames)));
        Ok(resp_builder.body(body)?)
    }
}

/// Response body produced by [CallbackGrpcService]
pub type CannedBody = BoxBody<Bytes, Status>;

type Callback =
    Arc<dyn Fn(GrpcRequest) -> BoxFuture<'static, anyhow::Result<CannedResponse>> + Send + Sync>;

/// gRPC service that invokes the given callback on each call
#[derive(Clone)]
pub struct CallbackGrpcService {
    callback: Callback,
}

impl CallbackGrpcService {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(GrpcRequest) -> BoxFuture<'static, anyhow::Result<CannedResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// A service answering every call with the same response
    pub fn always(resp: CannedResponse) -> Self {
        Self::new(move |_| {
            let resp = resp.clone();
            async move { Ok(resp) }.boxed()
        })
    }
}

impl<B> Service<Request<B>> for CallbackGrpcService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    type Response = Response<CannedBody>;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let callback = self.callback.clone();
        let (parts, body) = req.into_parts();
        let mut path_parts = parts.uri.path().trim_start_matches('/').split('/');
        let service = path_parts.next().unwrap_or_default().to_owned();
        let rpc = path_parts.next().unwrap_or_default().to_owned();
        async move {
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    let e: Box<dyn Error + Send + Sync> = e.into();
                    anyhow::anyhow!("reading request body: {e}")
                })?
                .to_bytes();
            let req = GrpcRequest {
                service,
                rpc,
                headers: parts.headers,
                body,
            };
            (callback)(req).await?.into_http()
        }
        .boxed()
    }
}
