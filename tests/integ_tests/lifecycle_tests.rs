use super::collect_results;
use futures_util::future::join_all;
use grpcannon::{
    BoxError, CallDataGenerator, CallStatsHandler, CorrelationToken, MethodDescriptor, RpcStats,
    RpcTagInfo, StatsHandler, StatsHandlerOptions,
};
use http::Extensions;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tonic::Status;

const CALLS: usize = 200;
const EVENT_TASKS: u32 = 4;

fn tag(h: &CallStatsHandler) -> (Arc<Extensions>, CorrelationToken) {
    let mut ctx = Extensions::new();
    h.tag_rpc(
        &mut ctx,
        &RpcTagInfo {
            full_method_name: "/pkg.Svc/Method".to_string(),
        },
    );
    let token = *ctx.get::<CorrelationToken>().expect("call was tagged");
    (Arc::new(ctx), token)
}

#[tokio::test]
async fn scenario_single_worker_call() {
    let generator = CallDataGenerator::default();
    let method = MethodDescriptor::from_call("pkg.Svc/Method").unwrap();
    let ctx = generator.new_context(&method, "w1", 1);
    assert!(generator.render_payload(&ctx, "").unwrap().is_empty());
    assert!(generator.render_metadata(&ctx, "").unwrap().is_empty());

    let (h, mut rx) = CallStatsHandler::new(StatsHandlerOptions::default());
    let (call, token) = tag(&h);
    let begin = Instant::now();
    h.handle_rpc(&call, RpcStats::Begin { begin_time: begin });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.handle_rpc(
        &call,
        RpcStats::End {
            begin_time: None,
            end_time: Instant::now(),
            error: None,
        },
    );

    let results = collect_results(&mut rx, 1).await;
    let res = &results[0];
    assert_eq!(res.token, token);
    assert!(res.error.is_none());
    assert_eq!(res.status_code, "");
    assert!(res.duration >= Duration::from_millis(50));
    assert!(res.duration < Duration::from_millis(1000));
    assert!(!h.is_tracked(&token));
}

/// Many calls in flight at once, each with its events fired from several tasks, must each produce
/// exactly one result carrying that call's own measurements.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_calls_are_not_cross_attributed() {
    let (h, mut rx) = CallStatsHandler::new(StatsHandlerOptions::default());
    let h = Arc::new(h);
    let base = Instant::now();

    let calls = (0..CALLS).map(|i| {
        let h = h.clone();
        tokio::spawn(async move {
            let (call, token) = tag(&h);
            h.handle_rpc(&call, RpcStats::Begin { begin_time: base });
            h.handle_rpc(&call, RpcStats::OutHeader);
            // Every call gets a distinct number of response payloads
            let payloads_per_task = i as u32 % 5 + 1;
            let event_tasks = (0..EVENT_TASKS).map(|_| {
                let h = h.clone();
                let call = call.clone();
                tokio::spawn(async move {
                    for _ in 0..payloads_per_task {
                        h.handle_rpc(
                            &call,
                            RpcStats::InPayload {
                                length: 8,
                                recv_time: Instant::now(),
                            },
                        );
                        tokio::task::yield_now().await;
                    }
                    h.handle_rpc(&call, RpcStats::InHeader);
                })
            });
            for res in join_all(event_tasks).await {
                res.unwrap();
            }
            h.handle_rpc(&call, RpcStats::InTrailer);
            let error = (i % 2 == 1)
                .then(|| Box::new(Status::unavailable(i.to_string())) as BoxError);
            h.handle_rpc(
                &call,
                RpcStats::End {
                    begin_time: Some(base),
                    end_time: base + Duration::from_millis(i as u64),
                    error,
                },
            );
            (token, i)
        })
    });
    let expected: HashMap<CorrelationToken, usize> = join_all(calls)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(expected.len(), CALLS);

    let results = collect_results(&mut rx, CALLS).await;
    assert!(rx.try_recv().is_none());
    assert_eq!(h.in_flight(), 0);

    let mut seen = HashMap::new();
    for res in results {
        let i = expected[&res.token];
        assert!(seen.insert(res.token, ()).is_none(), "duplicate result");
        assert_eq!(res.duration, Duration::from_millis(i as u64));
        assert_eq!(res.timing.in_payloads, EVENT_TASKS * (i as u32 % 5 + 1));
        assert!(res.timing.in_header.is_some());
        assert!(res.timing.in_trailer.is_some());
        if i % 2 == 1 {
            assert_eq!(res.status_code, "Unavailable");
            let status = res.error.unwrap().downcast::<Status>().unwrap();
            assert_eq!(status.message(), i.to_string());
        } else {
            assert!(res.error.is_none());
            assert_eq!(res.status_code, "");
        }
    }
    assert_eq!(seen.len(), CALLS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_ends_produce_one_result() {
    let (h, mut rx) = CallStatsHandler::new(StatsHandlerOptions::default());
    let h = Arc::new(h);
    let (call, token) = tag(&h);
    let enders = (0..16).map(|_| {
        let h = h.clone();
        let call = call.clone();
        tokio::spawn(async move {
            h.handle_rpc(
                &call,
                RpcStats::End {
                    begin_time: None,
                    end_time: Instant::now(),
                    error: None,
                },
            );
        })
    });
    for res in join_all(enders).await {
        res.unwrap();
    }
    let results = collect_results(&mut rx, 1).await;
    assert_eq!(results[0].token, token);
    assert!(rx.try_recv().is_none());
    assert!(!h.is_tracked(&token));
}
