mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{config, eventually, init_logging, published, ready_client, reply};
use profits_rpc::protocol::{build_response, decode_request};
use profits_rpc::{
    // ---
    ConnectionState,
    Kwargs,
    MemoryBroker,
    RpcClient,
    RpcError,
    RpcWorker,
};

const SECS_5: Duration = Duration::from_secs(5);

#[tokio::test]
async fn count_profits_round_trip() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;
    assert_eq!(broker.declared_queues(), vec!["client_queue", "server_queue"]);

    let jobs = json!([{"id": 1, "nodes_used": 4, "passmark": 9000}]);
    let slot = client.call("count_profits", vec![jobs.clone()], Kwargs::new());
    let id = slot.correlation_id().to_string();
    log::info!("count_profits sent with correlation id {id}");

    let sent = published(&broker, "client_queue", 1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].correlation_id.as_deref(), Some(id.as_str()));
    assert_eq!(sent[0].content_type.as_deref(), Some("application/json"));

    let request = decode_request(&sent[0].payload).unwrap();
    assert_eq!(request.method, "count_profits");
    assert_eq!(request.args, vec![jobs]);
    assert!(request.kwargs.is_empty());

    reply(
        &broker,
        &id,
        r#"{"status_code":200,"status_text":"OK","data":[{"id":1,"profit":12.5}]}"#,
    );

    let response = slot.await.unwrap();
    assert_eq!(
        response,
        build_response(200, "OK", json!([{"id": 1, "profit": 12.5}]))
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn responses_resolve_out_of_order() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let mut a = client.call("a", vec![], Kwargs::new());
    let b = client.call("b", vec![], Kwargs::new());
    let (a_id, b_id) = (a.correlation_id().to_string(), b.correlation_id().to_string());
    published(&broker, "client_queue", 2).await;

    reply(&broker, &b_id, r#"{"status_code":200,"status_text":"OK","data":"b"}"#);
    assert_eq!(b.await.unwrap().data, json!("b"));

    assert!(a.try_result().is_none());
    assert_eq!(client.pending_count(), 1);

    reply(&broker, &a_id, r#"{"status_code":200,"status_text":"OK","data":"a"}"#);
    assert_eq!(a.await.unwrap().data, json!("a"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn duplicate_delivery_is_a_no_op() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let slot = client.call("m", vec![], Kwargs::new());
    let id = slot.correlation_id().to_string();
    published(&broker, "client_queue", 1).await;

    reply(&broker, &id, r#"{"status_code":200,"status_text":"OK","data":1}"#);
    reply(&broker, &id, r#"{"status_code":200,"status_text":"OK","data":2}"#);

    assert_eq!(slot.await.unwrap().data, json!(1));
    eventually(|| client.stats().unmatched_responses == 1).await;
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn anomalies_are_counted_and_leave_the_table_alone() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let mut slot = client.call("m", vec![], Kwargs::new());
    let id = slot.correlation_id().to_string();
    published(&broker, "client_queue", 1).await;

    reply(&broker, "no-such-call", r#"{"status_code":200,"status_text":"OK","data":null}"#);
    reply(&broker, &id, "not json");
    broker.inject(profits_rpc::Message {
        queue: "server_queue".into(),
        payload: bytes::Bytes::from_static(b"{}"),
        correlation_id: None,
        content_type: None,
    });

    eventually(|| {
        let s = client.stats();
        s.unmatched_responses == 1 && s.decode_failures == 1 && s.missing_correlation_id == 1
    })
    .await;

    // undecodable body leaves the call pending
    assert_eq!(client.pending_count(), 1);
    assert!(slot.try_result().is_none());

    reply(&broker, &id, r#"{"status_code":200,"status_text":"OK","data":null}"#);
    assert!(slot.await.unwrap().is_success());
}

#[tokio::test]
async fn connection_failure_fails_current_and_future_calls() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    broker.fail_connect("ACCESS_REFUSED");

    let client = RpcClient::start(broker.transport("api"), config(SECS_5)).unwrap();
    let early = client.call("m", vec![], Kwargs::new());

    assert!(matches!(early.await, Err(RpcError::BrokerUnavailable(_))));
    assert!(matches!(client.wait_ready().await, Err(RpcError::BrokerUnavailable(_))));
    assert!(matches!(client.state(), ConnectionState::Failed(_)));

    let late = client.call("m", vec![], Kwargs::new());
    assert!(matches!(late.await, Err(RpcError::BrokerUnavailable(_))));
    assert_eq!(client.pending_count(), 0);
    assert!(broker.published("client_queue").is_empty());
}

#[tokio::test]
async fn declare_failure_fails_queued_calls() {
    // ---
    let broker = MemoryBroker::new();
    broker.fail_declare("PRECONDITION_FAILED");

    let client = RpcClient::start(broker.transport("api"), config(SECS_5)).unwrap();
    let slot = client.call("m", vec![], Kwargs::new());

    match slot.await {
        Err(RpcError::BrokerUnavailable(reason)) => assert!(reason.contains("PRECONDITION_FAILED")),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn publish_failure_fails_only_that_call() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    broker.fail_publish(Some("channel blocked".into()));
    let failed = client.call("m", vec![], Kwargs::new());
    assert!(matches!(failed.await, Err(RpcError::Publish(_))));
    assert_eq!(client.state(), ConnectionState::Subscribed);

    broker.fail_publish(None);
    let ok = client.call("m", vec![], Kwargs::new());
    let id = ok.correlation_id().to_string();
    published(&broker, "client_queue", 1).await;
    reply(&broker, &id, r#"{"status_code":200,"status_text":"OK","data":null}"#);
    assert!(ok.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let short = client.call_with_timeout("m", vec![], Kwargs::new(), Duration::from_secs(1));
    let mut long = client.call("m", vec![], Kwargs::new());

    assert!(matches!(short.await, Err(RpcError::Timeout)));
    assert!(long.try_result().is_none());
    assert_eq!(client.pending_count(), 1);

    assert!(matches!(long.await, Err(RpcError::Timeout)));
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.stats().timeouts, 2);
}

#[tokio::test(start_paused = true)]
async fn calls_wait_for_the_outbound_queue() {
    // ---
    let broker = MemoryBroker::new();
    broker.delay_declare("client_queue", Duration::from_millis(200));

    let client = RpcClient::start(broker.transport("api"), config(SECS_5)).unwrap();
    let first = client.call("first", vec![], Kwargs::new());
    let second = client.call("second", vec![], Kwargs::new());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.published("client_queue").is_empty());
    assert_eq!(client.pending_count(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let sent = broker.published("client_queue");
    let ids: Vec<_> = sent.iter().filter_map(|m| m.correlation_id.as_deref()).collect();
    assert_eq!(ids, vec![first.correlation_id().as_str(), second.correlation_id().as_str()]);
}

#[tokio::test]
async fn losing_the_consumer_fails_pending_calls() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let slot = client.call("m", vec![], Kwargs::new());
    published(&broker, "client_queue", 1).await;

    broker.drop_consumers("server_queue");
    assert!(matches!(slot.await, Err(RpcError::BrokerUnavailable(_))));
    assert!(matches!(client.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn close_fails_outstanding_calls() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, SECS_5).await;

    let slot = client.call("m", vec![], Kwargs::new());
    client.close().await.unwrap();

    assert!(matches!(slot.await, Err(RpcError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.call("m", vec![], Kwargs::new()).await, Err(RpcError::Closed)));

    // second close is harmless
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_racing_close_still_resolve() {
    // ---
    let broker = MemoryBroker::new();
    let client = ready_client(&broker, Duration::from_secs(3600)).await;

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                let mut slots = Vec::new();
                for _ in 0..200 {
                    slots.push(client.call("m", vec![], Kwargs::new()));
                    tokio::task::yield_now().await;
                }
                slots
            })
        })
        .collect();

    tokio::task::yield_now().await;
    client.close().await.unwrap();

    for caller in callers {
        for slot in caller.await.unwrap() {
            let outcome = tokio::time::timeout(Duration::from_secs(2), slot)
                .await
                .expect("call left unresolved after close");
            assert!(matches!(outcome, Err(RpcError::Closed)));
        }
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn worker_and_client_round_trip() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let worker = RpcWorker::new(broker.transport("worker"), &config(SECS_5));
    worker.register("count_profits", |args: Vec<Value>, _kwargs| async move {
        let jobs = args.into_iter().next().unwrap_or(Value::Null);
        let rows: Vec<Value> = jobs
            .as_array()
            .into_iter()
            .flatten()
            .map(|job| json!({"id": job["id"], "profit": job["passmark"].as_i64().unwrap_or(0) / 100}))
            .collect();
        Ok(rows)
    });
    let handle = worker.start().await.unwrap();

    let client = ready_client(&broker, SECS_5).await;
    let rows: Vec<Value> = client
        .call_for(
            "count_profits",
            vec![json!([{"id": 1, "passmark": 900}, {"id": 2, "passmark": 1500}])],
            Kwargs::new(),
        )
        .await
        .unwrap();
    assert_eq!(rows, vec![json!({"id": 1, "profit": 9}), json!({"id": 2, "profit": 15})]);

    let err = client
        .call_for::<Value>("missing", vec![], Kwargs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidResponse(_)));

    client.close().await.unwrap();
    worker.shutdown().await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn concurrent_callers_get_their_own_answers() {
    // ---
    let broker = MemoryBroker::new();
    let worker = RpcWorker::new(broker.transport("worker"), &config(SECS_5));
    worker.register("double", |args: Vec<Value>, _| async move {
        Ok(args.first().and_then(Value::as_i64).unwrap_or(0) * 2)
    });
    worker.start().await.unwrap();

    let client = ready_client(&broker, SECS_5).await;
    let tasks: Vec<_> = (0..16i64)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let v: i64 = client.call_for("double", vec![json!(i)], Kwargs::new()).await.unwrap();
                (i, v)
            })
        })
        .collect();

    for task in tasks {
        let (i, v) = task.await.unwrap();
        assert_eq!(v, i * 2);
    }
    assert_eq!(client.pending_count(), 0);
}
