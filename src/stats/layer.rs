//! A tower layer reporting the lifecycle of every gRPC call passing through a channel to a
//! [StatsHandler]. Wrap a tonic `Channel` (or any HTTP/2 gRPC service) with it before handing it
//! to a generated client.
//!
//! The wrapped service receives requests whose body is a [RequestBody]. tonic's `Channel` only
//! accepts `tonic::body::Body`, so box the body back up in between:
//! `ServiceBuilder::new().layer(StatsLayer::new(h)).map_request(|r: http::Request<_>|
//! r.map(tonic::body::Body::new)).service(channel)`.

use super::{BoxError, RpcStats, RpcTagInfo, StatsHandler};
use crate::errors::CallError;
use bytes::Buf;
use http::{Extensions, HeaderMap, StatusCode};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use std::{
    any::Any,
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Instant,
};
use tonic::{Code, Status};
use tower::{Layer, Service};

/// Applies [StatsSvc] to a service
pub struct StatsLayer<H: ?Sized> {
    handler: Arc<H>,
}

impl<H: ?Sized> StatsLayer<H> {
    /// Report calls to `handler`
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H: ?Sized> Clone for StatsLayer<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<S, H: ?Sized> Layer<S> for StatsLayer<H> {
    type Service = StatsSvc<S, H>;

    fn layer(&self, inner: S) -> Self::Service {
        StatsSvc {
            inner,
            handler: self.handler.clone(),
        }
    }
}

/// Tags each outgoing call and reports its lifecycle events to a [StatsHandler].
///
/// `Begin` and `OutHeader` fire when the call is dispatched, `OutPayload` for each request data
/// frame the transport sends, `InHeader` when response headers arrive, `InPayload` for each
/// response data frame and `InTrailer` when trailers arrive. `End` fires exactly once: on trailers,
/// right after headers for trailers-only or non-200 responses, on failure, or when the call is
/// dropped before it completed (reported as `Cancelled`). A response which never states a
/// `grpc-status` counts as failed.
pub struct StatsSvc<S, H: ?Sized> {
    inner: S,
    handler: Arc<H>,
}

impl<S: Clone, H: ?Sized> Clone for StatsSvc<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S, H, ReqBody, ResBody> Service<http::Request<ReqBody>> for StatsSvc<S, H>
where
    S: Service<http::Request<RequestBody<ReqBody, H>>, Response = http::Response<ResBody>>,
    S::Error: Display,
    H: StatsHandler + ?Sized,
{
    type Response = http::Response<StatsBody<ResBody, H>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, H>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        let info = RpcTagInfo {
            full_method_name: req.uri().path().to_owned(),
        };
        self.handler.tag_rpc(req.extensions_mut(), &info);
        let ctx = req.extensions().clone();
        let guard = CallGuard {
            handler: self.handler.clone(),
            ctx: ctx.clone(),
            begin_time: Instant::now(),
            done: false,
        };
        guard.emit(RpcStats::Begin {
            begin_time: guard.begin_time,
        });
        guard.emit(RpcStats::OutHeader);
        let handler = self.handler.clone();
        let req = req.map(|inner| RequestBody {
            inner,
            handler,
            ctx,
        });
        ResponseFuture {
            inner: self.inner.call(req),
            guard: Some(guard),
        }
    }
}

/// Response future of [StatsSvc]
#[pin_project]
pub struct ResponseFuture<F, H: StatsHandler + ?Sized> {
    #[pin]
    inner: F,
    guard: Option<CallGuard<H>>,
}

impl<F, H, ResBody, E> Future for ResponseFuture<F, H>
where
    F: Future<Output = Result<http::Response<ResBody>, E>>,
    E: Display,
    H: StatsHandler + ?Sized,
{
    type Output = Result<http::Response<StatsBody<ResBody, H>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = ready!(this.inner.poll(cx));
        let mut guard = this.guard.take();
        match res {
            Ok(resp) => {
                if let Some(g) = guard.take() {
                    g.emit(RpcStats::InHeader);
                    // Status in the headers means a trailers-only response, and anything but 200
                    // isn't a gRPC response at all. Either way there's no body to wait for.
                    if resp.status() != StatusCode::OK
                        || Status::from_header_map(resp.headers()).is_some()
                    {
                        g.finish_with_status(infer_status(resp.status(), Some(resp.headers())));
                    } else {
                        guard = Some(g);
                    }
                }
                Poll::Ready(Ok(resp.map(|inner| StatsBody { inner, guard })))
            }
            Err(e) => {
                if let Some(g) = guard {
                    g.finish(Some(Box::new(CallError::Transport(e.to_string()))));
                }
                Poll::Ready(Err(e))
            }
        }
    }
}

/// Response body of [StatsSvc]
#[pin_project]
pub struct StatsBody<B, H: StatsHandler + ?Sized> {
    #[pin]
    inner: B,
    guard: Option<CallGuard<H>>,
}

impl<B, H> Body for StatsBody<B, H>
where
    B: Body,
    B::Error: Display + 'static,
    H: StatsHandler + ?Sized,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    if let Some(g) = this.guard.as_ref() {
                        g.emit(RpcStats::InPayload {
                            length: data.remaining(),
                            recv_time: Instant::now(),
                        });
                    }
                } else if let Some(trailers) = frame.trailers_ref() {
                    if let Some(g) = this.guard.take() {
                        g.emit(RpcStats::InTrailer);
                        g.finish_with_status(infer_status(StatusCode::OK, Some(trailers)));
                    }
                }
            }
            Some(Err(e)) => {
                if let Some(g) = this.guard.take() {
                    let err: BoxError = match (e as &dyn Any).downcast_ref::<Status>() {
                        Some(status) => Box::new(status.clone()),
                        None => Box::new(CallError::Body(e.to_string())),
                    };
                    g.finish(Some(err));
                }
            }
            None => {
                if let Some(g) = this.guard.take() {
                    g.finish_with_status(infer_status(StatusCode::OK, None));
                }
            }
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Request body of [StatsSvc]. Reports an `OutPayload` for every data frame the transport takes
/// from it.
#[pin_project]
pub struct RequestBody<B, H: ?Sized> {
    #[pin]
    inner: B,
    handler: Arc<H>,
    ctx: Extensions,
}

impl<B, H> Body for RequestBody<B, H>
where
    B: Body,
    H: StatsHandler + ?Sized,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &polled {
            if let Some(data) = frame.data_ref() {
                this.handler.handle_rpc(
                    this.ctx,
                    RpcStats::OutPayload {
                        length: data.remaining(),
                        sent_time: Instant::now(),
                    },
                );
            }
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Final status of a call, read from `grpc-status` in `trailers`. Responses without one are
/// failures, with a code derived from the HTTP status the same way gRPC clients derive it.
fn infer_status(http_status: StatusCode, trailers: Option<&HeaderMap>) -> Status {
    if let Some(status) = trailers.and_then(Status::from_header_map) {
        return status;
    }
    if http_status == StatusCode::OK {
        return Status::internal("grpc-status missing from response");
    }
    let code = match http_status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(
        code,
        format!(
            "grpc-status header missing, mapped from HTTP status code {}",
            http_status.as_u16()
        ),
    )
}

/// Owns the reporting of one call. Reports `End` exactly once, even if the call is abandoned.
struct CallGuard<H: StatsHandler + ?Sized> {
    handler: Arc<H>,
    ctx: Extensions,
    begin_time: Instant,
    done: bool,
}

impl<H: StatsHandler + ?Sized> CallGuard<H> {
    fn emit(&self, stats: RpcStats) {
        self.handler.handle_rpc(&self.ctx, stats);
    }

    fn finish(mut self, error: Option<BoxError>) {
        self.end(error);
    }

    fn finish_with_status(self, status: Status) {
        let error = (status.code() != Code::Ok).then(|| Box::new(status) as BoxError);
        self.finish(error);
    }

    fn end(&mut self, error: Option<BoxError>) {
        self.done = true;
        self.emit(RpcStats::End {
            begin_time: Some(self.begin_time),
            end_time: Instant::now(),
            error,
        });
    }
}

impl<H: StatsHandler + ?Sized> Drop for CallGuard<H> {
    fn drop(&mut self) {
        if !self.done {
            self.end(Some(Box::new(Status::cancelled(
                "call dropped before it completed",
            ))));
        }
    }
}
