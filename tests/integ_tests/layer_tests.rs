use super::collect_results;
use bytes::Bytes;
use futures_util::{FutureExt, future::join_all};
use grpcannon::{
    CallDataGenerator, CallError, CallStatsHandler, SeededIdSource, StatsHandlerOptions,
    StatsLayer, apply_metadata,
};
use grpcannon_test_utils::{CallbackGrpcService, CannedResponse, GREETER_PATH, greeter_method};
use http_body_util::{BodyExt, Full};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tonic::{Code, metadata::MetadataMap};
use tower::{Layer, ServiceExt};

type Req = http::Request<Full<Bytes>>;

fn handler() -> (Arc<CallStatsHandler>, grpcannon::CallResults) {
    let (h, rx) = CallStatsHandler::new(StatsHandlerOptions::default());
    (Arc::new(h), rx)
}

fn request(payload: Vec<u8>, metadata: MetadataMap) -> Req {
    let mut req = http::Request::builder()
        .method("POST")
        .uri(format!("http://localhost{GREETER_PATH}"))
        .body(Full::new(Bytes::from(payload)))
        .unwrap();
    req.headers_mut().extend(metadata.into_headers());
    req
}

#[tokio::test]
async fn streamed_response_is_fully_measured() {
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::always(CannedResponse::ok([
        Bytes::from_static(b"one"),
        Bytes::from_static(b"two"),
        Bytes::from_static(b"three"),
    ])));
    let resp = svc
        .oneshot(request(vec![], MetadataMap::new()))
        .await
        .unwrap();
    let collected = resp.into_body().collect().await.unwrap();
    assert!(collected.trailers().is_some());

    let res = collect_results(&mut rx, 1).await;
    let res = &res[0];
    assert!(res.error.is_none());
    assert_eq!(res.status_code, "");
    assert_eq!(res.timing.in_payloads, 3);
    assert!(res.timing.begin.is_some());
    assert!(res.timing.out_header.is_some());
    assert!(res.timing.in_header.is_some());
    assert!(res.timing.in_trailer.is_some());
    assert_eq!(h.in_flight(), 0);
}

#[tokio::test]
async fn failure_in_trailers_is_reported() {
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::always(
        CannedResponse::failed_after(
            [Bytes::from_static(b"partial")],
            Code::ResourceExhausted,
            "slow down",
        ),
    ));
    let resp = svc
        .oneshot(request(vec![], MetadataMap::new()))
        .await
        .unwrap();
    resp.into_body().collect().await.unwrap();

    let res = collect_results(&mut rx, 1).await.remove(0);
    assert_eq!(res.status_code, "ResourceExhausted");
    assert_eq!(res.timing.in_payloads, 1);
    let status = res.error.unwrap().downcast::<tonic::Status>().unwrap();
    assert_eq!(status.message(), "slow down");
}

#[tokio::test]
async fn trailers_only_failure_is_reported() {
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::always(
        CannedResponse::trailers_only(Code::Unauthenticated, "who are you"),
    ));
    let resp = svc
        .oneshot(request(vec![], MetadataMap::new()))
        .await
        .unwrap();
    let res = collect_results(&mut rx, 1).await.remove(0);
    assert_eq!(res.status_code, "Unauthenticated");
    assert_eq!(res.timing.in_payloads, 0);
    // Reading the empty body afterwards must not report the call again
    resp.into_body().collect().await.unwrap();
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn service_failure_is_a_transport_error() {
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::new(|_| {
        async { Err(anyhow::anyhow!("connection reset")) }.boxed()
    }));
    let Err(err) = svc.oneshot(request(vec![], MetadataMap::new())).await else {
        panic!("call should have failed");
    };
    assert_eq!(err.to_string(), "connection reset");
    let res = collect_results(&mut rx, 1).await.remove(0);
    assert_eq!(res.status_code, "");
    assert_matches::assert_matches!(
        res.error.unwrap().downcast_ref::<CallError>(),
        Some(CallError::Transport(msg)) if msg == "connection reset"
    );
}

#[tokio::test]
async fn duration_covers_server_latency() {
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::new(|_| {
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(CannedResponse::ok([Bytes::from_static(b"late")]))
        }
        .boxed()
    }));
    let resp = svc
        .oneshot(request(vec![], MetadataMap::new()))
        .await
        .unwrap();
    resp.into_body().collect().await.unwrap();
    let res = collect_results(&mut rx, 1).await.remove(0);
    assert!(res.duration >= Duration::from_millis(30));
}

#[tokio::test]
async fn rendered_metadata_reaches_server() {
    let (h, mut rx) = handler();
    let dg = CallDataGenerator::new(Arc::new(SeededIdSource::new(7)));
    let ctx = dg.new_context(&greeter_method(), "w1", 3);
    let payload = dg
        .render_payload(&ctx, r#"{"name": "{{ MethodName }} #{{ RequestNumber }}"}"#)
        .unwrap();
    assert_eq!(payload, br#"{"name": "SayHello #3"}"#);
    let rendered = dg
        .render_metadata(&ctx, r#"{"x-worker": "{{ WorkerID }}", "x-call-id": "{{ UUID }}"}"#)
        .unwrap();
    let mut md = MetadataMap::new();
    apply_metadata(&rendered, &mut md).unwrap();

    let expected_id = ctx.uuid.clone();
    let expected_body = Bytes::from(payload.clone());
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::new(move |req| {
        let expected_id = expected_id.clone();
        let expected_body = expected_body.clone();
        async move {
            assert_eq!(req.body, expected_body);
            assert_eq!(req.service, "helloworld.Greeter");
            assert_eq!(req.rpc, "SayHello");
            assert_eq!(req.headers.get("x-worker").unwrap(), "w1");
            assert_eq!(req.headers.get("x-call-id").unwrap(), expected_id.as_str());
            Ok(CannedResponse::ok([]))
        }
        .boxed()
    }));
    let resp = svc.oneshot(request(payload, md)).await.unwrap();
    resp.into_body().collect().await.unwrap();
    let res = collect_results(&mut rx, 1).await.remove(0);
    assert!(res.error.is_none());
    assert_eq!(res.timing.out_payloads, 1);
    assert!(res.timing.out_payload.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_each_report_once() {
    const CALLS: usize = 50;
    let (h, mut rx) = handler();
    let svc = StatsLayer::new(h.clone()).layer(CallbackGrpcService::new(|req| {
        async move {
            let delay: u64 = req
                .headers
                .get("x-delay-ms")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(CannedResponse::ok([Bytes::from(delay.to_string())]))
        }
        .boxed()
    }));
    let calls = (0..CALLS).map(|i| {
        let svc = svc.clone();
        tokio::spawn(async move {
            let mut md = MetadataMap::new();
            md.insert("x-delay-ms", (i % 10).to_string().parse().unwrap());
            let resp = svc.oneshot(request(vec![], md)).await.unwrap();
            resp.into_body().collect().await.unwrap().to_bytes()
        })
    });
    for (i, body) in join_all(calls).await.into_iter().enumerate() {
        let body = body.unwrap();
        // 5 byte frame prefix, then the echoed delay
        assert_eq!(&body[5..], (i % 10).to_string().as_bytes());
    }

    let results = collect_results(&mut rx, CALLS).await;
    let tokens: HashSet<_> = results.iter().map(|r| r.token).collect();
    assert_eq!(tokens.len(), CALLS);
    assert!(results.iter().all(|r| r.error.is_none()));
    assert!(rx.try_recv().is_none());
    assert_eq!(h.in_flight(), 0);
}
