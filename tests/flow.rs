mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use flowgate::dispatch::LeaderResolver;
use flowgate::gateway::GatewayOptions;
use flowgate::params::{json_to_struct, struct_to_json};
use flowgate::proto::{JinaRpcClient, StatusCode};
use flowgate::reduce::{Reduce, Reducers, Slot};
use flowgate::request::routes::well_ordered;
use flowgate::{DeploymentSpec, FlowDescription, MergeStrategy, Polling};
use futures::StreamExt;
use serde_json::json;

use common::*;

fn linear(executors: &[&FakeExecutor]) -> FlowDescription {
    let mut deployments = Vec::new();
    let mut previous: Option<&str> = None;
    for executor in executors {
        let mut spec = DeploymentSpec::new(executor.name.clone(), executor.endpoint());
        if let Some(previous) = previous {
            spec = spec.needs([previous]);
        }
        deployments.push(spec);
        previous = Some(&executor.name);
    }
    FlowDescription::new(deployments)
}

fn endpoints(executors: &[&FakeExecutor]) -> Vec<flowgate::EndpointSpec> {
    executors.iter().map(|e| e.endpoint()).collect()
}

#[tokio::test]
async fn two_echo_executors_in_a_row() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b]), test_config(), &endpoints(&[&a, &b])).await;

    let response = gateway
        .streamer()
        .unary(request("r1", "/index", &["d1", "d2"]))
        .await
        .unwrap();
    let body = response.body().unwrap();
    assert_eq!(body.request_id(), "r1");
    assert_eq!(body.status_code(), StatusCode::Success);
    assert_eq!(doc_texts(&response), ["d1", "d2"]);
    assert_eq!(route_names(&response), ["gateway", "A", "B"]);
    assert!(well_ordered(&body.routes));
}

#[tokio::test]
async fn parallel_branches_concat_in_needs_order() {
    let a = FakeExecutor::spawn("A", Behaviour::Tag).await;
    let b = FakeExecutor::spawn("B", Behaviour::Tag).await;
    let flow = FlowDescription::new(vec![
        DeploymentSpec::new("A", a.endpoint()),
        DeploymentSpec::new("B", b.endpoint()),
    ]);
    let gateway = ready_gateway(flow, test_config(), &endpoints(&[&a, &b])).await;

    let response = gateway
        .streamer()
        .unary(request("r2", "/search", &["d1"]))
        .await
        .unwrap();
    assert_eq!(response.request_id().unwrap(), "r2");
    assert_eq!(doc_texts(&response), ["A(d1)", "B(d1)"]);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn prefetch_bounds_in_flight_requests() {
    let slow = FakeExecutor::spawn("slow", Behaviour::Sleep(Duration::from_millis(10))).await;
    let mut config = test_config();
    config.prefetch = 2;
    let gateway = ready_gateway(linear(&[&slow]), config, &endpoints(&[&slow])).await;

    let ingress = futures::stream::iter(
        (0..50).map(|i| Ok::<_, flowgate::GatewayError>(request(&format!("r{i}"), "/index", &["d"]))),
    );
    let started = Instant::now();
    let responses: Vec<_> = gateway.streamer().open(ingress).unwrap().collect().await;
    let elapsed = started.elapsed();

    assert_eq!(responses.len(), 50);
    assert!(slow.max_active() <= 2, "saw {} concurrent calls", slow.max_active());
    assert!(elapsed >= Duration::from_millis(240), "finished in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "finished in {elapsed:?}");
    assert_eq!(gateway.metrics().in_flight(), 0);
}

#[tokio::test]
async fn cancelled_stream_answers_every_request() {
    let slow = FakeExecutor::spawn("slow", Behaviour::Sleep(Duration::from_secs(1))).await;
    let mut config = test_config();
    config.drain = Duration::from_millis(200);
    let gateway = ready_gateway(linear(&[&slow]), config, &endpoints(&[&slow])).await;

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    for i in 0..5 {
        tx.send(Ok(request(&format!("r{i}"), "/index", &[]))).await.unwrap();
    }
    let responses = gateway
        .streamer()
        .open(tokio_stream::wrappers::ReceiverStream::new(rx))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(Err(flowgate::GatewayError::Cancelled("client cancelled".into())))
        .await
        .unwrap();

    let answered: Vec<_> = tokio::time::timeout(Duration::from_secs(5), responses.collect::<Vec<_>>())
        .await
        .expect("stream did not close after cancellation");
    assert_eq!(answered.len(), 5);
    let mut ids: Vec<_> = answered
        .iter()
        .map(|r| r.request_id().unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, ["r0", "r1", "r2", "r3", "r4"]);
    for response in &answered {
        let status = response.body().unwrap().status.clone().unwrap_or_default();
        let cancelled = status
            .exception
            .as_ref()
            .is_some_and(|e| e.name == "CANCELLED");
        assert!(
            status.code() == StatusCode::Success || cancelled,
            "unexpected status {status:?}"
        );
    }
    assert!(gateway.streamer().wait_idle(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn target_executor_bypasses_the_others() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let c = FakeExecutor::spawn("C", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b, &c]), test_config(), &endpoints(&[&a, &b, &c])).await;

    let mut input = request("r5", "/index", &["d1"]);
    input.body_mut().unwrap().target_executor = "^B$".into();
    let response = gateway.streamer().unary(input).await.unwrap();

    assert_eq!(route_names(&response), ["gateway", "B"]);
    assert_eq!((a.calls(), b.calls(), c.calls()), (0, 1, 0));
    assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
}

#[tokio::test]
async fn executor_error_stops_the_chain() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Fail("boom")).await;
    let c = FakeExecutor::spawn("C", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b, &c]), test_config(), &endpoints(&[&a, &b, &c])).await;

    let response = gateway
        .streamer()
        .unary(request("r6", "/index", &["d1"]))
        .await
        .unwrap();
    let status = response.body().unwrap().status.clone().unwrap();
    assert_eq!(status.code(), StatusCode::Error);
    assert!(status.description.contains("boom"));
    let routes = route_names(&response);
    assert!(routes.contains(&"A".to_string()));
    assert!(routes.contains(&"B".to_string()));
    assert!(!routes.contains(&"C".to_string()));
    assert_eq!(c.calls(), 0);
    assert_eq!(response.request_id().unwrap(), "r6");
}

#[tokio::test]
async fn empty_stream_closes_cleanly() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a]), test_config(), &endpoints(&[&a])).await;

    let responses: Vec<_> = gateway
        .streamer()
        .open(futures::stream::empty::<flowgate::error::Result<flowgate::DataRequest>>())
        .unwrap()
        .collect()
        .await;
    assert!(responses.is_empty());
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn linear_flow_records_a_route_per_executor() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let c = FakeExecutor::spawn("C", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b, &c]), test_config(), &endpoints(&[&a, &b, &c])).await;

    let response = gateway
        .streamer()
        .unary(request("", "/index", &[]))
        .await
        .unwrap();
    let body = response.body().unwrap();
    assert_eq!(body.status_code(), StatusCode::Success);
    assert_eq!(body.request_id().len(), 32);
    let executors: Vec<_> = body.routes.iter().filter(|r| !r.is_gateway()).map(|r| r.executor.as_str()).collect();
    assert_eq!(executors, ["A", "B", "C"]);
    assert!(well_ordered(&body.routes));
}

#[tokio::test]
async fn one_shard_down_with_polling_all() {
    let live = FakeExecutor::spawn("shard0", Behaviour::Tag).await;
    let mut spec = DeploymentSpec::new("indexer", live.endpoint().with_shard(0, 0));
    spec.shards = 2;
    spec.polling = Polling::All;
    spec.endpoints.push(down_endpoint().await.with_shard(1, 0));
    spec.retries = Some(0);
    let gateway = ready_gateway(FlowDescription::new(vec![spec]), test_config(), &[live.endpoint()]).await;

    let response = gateway
        .streamer()
        .unary(request("r7", "/index", &["d1"]))
        .await
        .unwrap();
    let body = response.body().unwrap();
    assert_eq!(body.status_code(), StatusCode::ErrorChained);
    assert_eq!(doc_texts(&response), ["shard0(d1)"]);
}

#[tokio::test]
async fn any_polling_with_no_replica_left_is_unavailable() {
    let spec = DeploymentSpec::new("indexer", down_endpoint().await);
    let gateway = ready_gateway(FlowDescription::new(vec![spec]), test_config(), &[]).await;

    let response = gateway
        .streamer()
        .unary(request("r8", "/index", &["d1"]))
        .await
        .unwrap();
    let status = response.body().unwrap().status.clone().unwrap();
    assert_eq!(status.code(), StatusCode::Error);
    assert!(status.description.starts_with("UNAVAILABLE"), "{}", status.description);
    assert_eq!(response.request_id().unwrap(), "r8");
}

#[tokio::test]
async fn reducer_executor_receives_the_shard_matrix() {
    let shard0 = FakeExecutor::spawn("s0", Behaviour::Echo).await;
    let shard1 = FakeExecutor::spawn("s1", Behaviour::Echo).await;
    let reducer = FakeExecutor::spawn("reduce", Behaviour::Echo).await;
    let mut spec = DeploymentSpec::new("indexer", shard0.endpoint().with_shard(0, 0));
    spec.shards = 2;
    spec.polling = Polling::All;
    spec.reduce = MergeStrategy::ReducerExec;
    spec.endpoints.push(shard1.endpoint().with_shard(1, 0));
    spec.reducer = Some(reducer.endpoint());
    let up = endpoints(&[&shard0, &shard1, &reducer]);
    let gateway = ready_gateway(FlowDescription::new(vec![spec]), test_config(), &up).await;

    let response = gateway
        .streamer()
        .unary(request("r9", "/index", &["d1"]))
        .await
        .unwrap();
    assert_eq!(reducer.list_calls(), 1);
    assert_eq!(doc_texts(&response), ["reduce(d1)", "reduce(d1)"]);
    assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
}

#[tokio::test]
async fn specific_parameters_and_results() {
    let a = FakeExecutor::spawn("A", Behaviour::Results(json!({"count": 3}))).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b]), test_config(), &endpoints(&[&a, &b])).await;

    let mut input = request("r10", "/search", &["d1"]);
    input.body_mut().unwrap().parameters = Some(json_to_struct(
        json!({"top_k": 5, "A__top_k": 1}).as_object().unwrap(),
    ));
    let response = gateway.streamer().unary(input).await.unwrap();

    let seen_by_a = struct_to_json(a.received()[0].parameters.as_ref().unwrap());
    assert_eq!(seen_by_a["top_k"], json!(1));
    assert!(!seen_by_a.contains_key("A__top_k"));
    let seen_by_b = struct_to_json(b.received()[0].parameters.as_ref().unwrap());
    assert_eq!(seen_by_b["top_k"], json!(5));
    assert!(!seen_by_b.contains_key("A__top_k"));

    let egress = struct_to_json(response.body().unwrap().parameters.as_ref().unwrap());
    assert_eq!(egress["top_k"], json!(5));
    assert_eq!(egress["A__top_k"], json!(1));
    assert_eq!(egress["__results__"], json!({"A": {"count": 3}}));
}

#[tokio::test]
async fn grpc_call_end_to_end() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Tag).await;
    let gateway = ready_gateway(linear(&[&a, &b]), test_config(), &endpoints(&[&a, &b])).await;
    let running = gateway.start().await.unwrap();
    let address = running.grpc_address().unwrap();

    let mut client = JinaRpcClient::connect(format!("http://{address}")).await.unwrap();
    let requests = vec![
        request("g1", "/index", &["d1"]),
        request("g2", "/index", &["d2"]),
        request("g3", "/index", &["d3"]),
    ];
    let mut responses = client
        .call(futures::stream::iter(requests))
        .await
        .unwrap()
        .into_inner();
    let mut ids = Vec::new();
    while let Some(response) = responses.message().await.unwrap() {
        assert_eq!(route_names(&response), ["gateway", "A", "B"]);
        ids.push(response.request_id().unwrap().to_string());
    }
    ids.sort();
    assert_eq!(ids, ["g1", "g2", "g3"]);

    running.shutdown().await;
}

#[tokio::test]
async fn undeclared_document_fields_pass_through() {
    let a = FakeExecutor::spawn("A", Behaviour::Tag).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a, &b]), test_config(), &endpoints(&[&a, &b])).await;

    let mut input = request("r12", "/index", &[]);
    input.body_mut().unwrap().data.push(doc_with_embedding("d1"));
    let response = gateway.streamer().unary(input).await.unwrap();

    assert_eq!(doc_texts(&response), ["A(d1)"]);
    let egress = &response.body().unwrap().data[0];
    assert_eq!(&egress.unknown_fields()[..], &EMBEDDING_FIELD[..]);
    assert_eq!(&b.received()[0].data[0].unknown_fields()[..], &EMBEDDING_FIELD[..]);
    let wire = response.to_bytes();
    assert!(wire.windows(EMBEDDING_FIELD.len()).any(|w| w == EMBEDDING_FIELD));
}

#[tokio::test]
async fn deadline_surfaces_as_a_timeout() {
    let fast = FakeExecutor::spawn("fast", Behaviour::Echo).await;
    let slow = FakeExecutor::spawn("slow", Behaviour::Sleep(Duration::from_secs(2))).await;
    let gateway = ready_gateway(linear(&[&fast, &slow]), test_config(), &endpoints(&[&fast, &slow])).await;

    let mut input = request("r13", "/index", &["d1"]);
    input.body_mut().unwrap().parameters = Some(json_to_struct(
        json!({"deadline_ms": 100}).as_object().unwrap(),
    ));
    let started = Instant::now();
    let response = gateway.streamer().unary(input).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());

    let body = response.body().unwrap();
    assert_eq!(body.request_id(), "r13");
    let status = body.status.clone().unwrap();
    assert_eq!(status.code(), StatusCode::Error);
    assert!(status.description.starts_with("DEADLINE_EXCEEDED: "), "{}", status.description);
    assert!(status.description.contains("`slow`"), "{}", status.description);
    assert_eq!(status.exception.unwrap().name, "TIMEOUT");
    assert_eq!(route_names(&response), ["gateway", "fast"]);
    assert!(body.routes[0].end_time.is_some());
}

#[tokio::test]
async fn target_executor_is_matched_from_the_start_of_the_name() {
    let ab = FakeExecutor::spawn("AB", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&ab, &b]), test_config(), &endpoints(&[&ab, &b])).await;

    let mut input = request("r14", "/index", &["d1"]);
    input.body_mut().unwrap().target_executor = "B".into();
    let response = gateway.streamer().unary(input).await.unwrap();

    assert_eq!(route_names(&response), ["gateway", "B"]);
    assert_eq!((ab.calls(), b.calls()), (0, 1));
}

#[tokio::test]
async fn failed_replica_is_retried_on_its_sibling() {
    let flaky = FakeExecutor::spawn("flaky", Behaviour::Unavailable("draining")).await;
    let good = FakeExecutor::spawn("good", Behaviour::Tag).await;
    let mut spec = DeploymentSpec::new("encoder", flaky.endpoint().with_shard(0, 0));
    spec.replicas = 2;
    spec.endpoints.push(good.endpoint().with_shard(0, 1));
    let gateway = ready_gateway(FlowDescription::new(vec![spec]), test_config(), &endpoints(&[&flaky, &good])).await;

    for i in 0..3 {
        let response = gateway
            .streamer()
            .unary(request(&format!("r{i}"), "/index", &["d1"]))
            .await
            .unwrap();
        assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
        assert_eq!(doc_texts(&response), ["good(d1)"]);
        let route = response.body().unwrap().routes.last().cloned().unwrap();
        assert!(route.pod_id.ends_with(&good.endpoint().address()), "{}", route.pod_id);
    }
    // the first pick lands on the flaky replica, which is declared first
    assert!(flaky.calls() >= 1);
    assert_eq!(good.calls(), 3);
}

#[tokio::test]
async fn busy_replica_is_passed_over() {
    let busy = FakeExecutor::spawn("busy", Behaviour::Sleep(Duration::from_millis(500))).await;
    let idle = FakeExecutor::spawn("idle", Behaviour::Echo).await;
    let mut spec = DeploymentSpec::new("encoder", busy.endpoint().with_shard(0, 0));
    spec.replicas = 2;
    spec.endpoints.push(idle.endpoint().with_shard(0, 1));
    let gateway = ready_gateway(FlowDescription::new(vec![spec]), test_config(), &endpoints(&[&busy, &idle])).await;

    let streamer = gateway.streamer().clone();
    let held = tokio::spawn(async move { streamer.unary(request("held", "/index", &["d0"])).await });
    tokio::time::timeout(Duration::from_secs(2), async {
        while busy.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the first request never reached the busy replica");

    for i in 0..3 {
        let response = gateway
            .streamer()
            .unary(request(&format!("q{i}"), "/index", &["d1"]))
            .await
            .unwrap();
        assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
    }
    assert_eq!(idle.calls(), 3);
    assert_eq!(busy.calls(), 1);

    let held = held.await.unwrap().unwrap();
    assert_eq!(held.body().unwrap().status_code(), StatusCode::Success);
}

/// Hands out the queued addresses in order, then keeps repeating the last.
struct ScriptedLeader {
    answers: Mutex<Vec<String>>,
    asked: AtomicUsize,
}

impl ScriptedLeader {
    fn new(answers: Vec<String>) -> Self {
        Self {
            answers: Mutex::new(answers),
            asked: AtomicUsize::new(0),
        }
    }
}

impl LeaderResolver for ScriptedLeader {
    fn leader(&self, deployment: &str, shard: usize) -> Option<String> {
        assert_eq!((deployment, shard), ("store", 0));
        self.asked.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            Some(answers.remove(0))
        } else {
            answers.first().cloned()
        }
    }
}

#[tokio::test]
async fn writes_follow_the_leader_after_a_redirect() {
    let follower = FakeExecutor::spawn("follower", Behaviour::Unavailable("not the leader")).await;
    let leader = FakeExecutor::spawn("leader", Behaviour::Tag).await;
    let mut spec = DeploymentSpec::new("store", follower.endpoint().with_shard(0, 0));
    spec.replicas = 2;
    spec.endpoints.push(leader.endpoint().with_shard(0, 1));
    spec.stateful = true;
    spec.write_endpoints = vec!["/index".into()];
    let resolver = Arc::new(ScriptedLeader::new(vec![
        follower.endpoint().address(),
        leader.endpoint().address(),
    ]));
    let options = GatewayOptions {
        leader: Some(resolver.clone()),
        ..Default::default()
    };
    let gateway = ready_gateway_with(
        FlowDescription::new(vec![spec]),
        test_config(),
        options,
        &endpoints(&[&follower, &leader]),
    )
    .await;

    let response = gateway
        .streamer()
        .unary(request("w1", "/index", &["d1"]))
        .await
        .unwrap();
    assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
    assert_eq!(doc_texts(&response), ["leader(d1)"]);
    assert_eq!((follower.calls(), leader.calls()), (1, 1));
    assert_eq!(resolver.asked.load(Ordering::SeqCst), 2);
    let route = response.body().unwrap().routes.last().cloned().unwrap();
    assert_eq!(route.pod_id, format!("store/0/leader@{}", leader.endpoint().address()));

    // reads pick any replica and never ask for the leader
    let response = gateway
        .streamer()
        .unary(request("q1", "/search", &["d1"]))
        .await
        .unwrap();
    assert_eq!(response.body().unwrap().status_code(), StatusCode::Success);
    assert_eq!(resolver.asked.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn undeclared_endpoints_share_a_metrics_label() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let gateway = ready_gateway(linear(&[&a]), test_config(), &endpoints(&[&a])).await;

    for endpoint in ["/x-1", "/x-2", "/default"] {
        gateway
            .streamer()
            .unary(request("", endpoint, &[]))
            .await
            .unwrap();
    }
    let text = gateway.metrics().render_prometheus();
    assert!(!text.contains("/x-1") && !text.contains("/x-2"), "{text}");
    assert!(text.contains(r#"endpoint="other""#), "{text}");
    assert!(text.contains(r#"endpoint="/default""#), "{text}");
}

/// A join merge that always refuses.
struct Refuse;

impl Reduce for Refuse {
    fn reduce(&self, _slots: Vec<Slot>) -> flowgate::error::Result<flowgate::DataRequest> {
        Err(flowgate::GatewayError::BadRequest("partials disagree".into()))
    }
}

#[tokio::test]
async fn failed_join_merge_keeps_the_routes() {
    let a = FakeExecutor::spawn("A", Behaviour::Echo).await;
    let b = FakeExecutor::spawn("B", Behaviour::Echo).await;
    let c = FakeExecutor::spawn("C", Behaviour::Echo).await;
    let flow = FlowDescription::new(vec![
        DeploymentSpec::new("A", a.endpoint()),
        DeploymentSpec::new("B", b.endpoint()),
        DeploymentSpec::new("C", c.endpoint()).needs(["A", "B"]),
    ]);
    let options = GatewayOptions {
        reducers: Reducers::default().with_override("C", Arc::new(Refuse)),
        ..Default::default()
    };
    let gateway = ready_gateway_with(flow, test_config(), options, &endpoints(&[&a, &b, &c])).await;

    let response = gateway
        .streamer()
        .unary(request("r15", "/index", &["d1"]))
        .await
        .unwrap();
    let body = response.body().unwrap();
    assert_eq!(body.request_id(), "r15");
    let status = body.status.clone().unwrap();
    assert_eq!(status.code(), StatusCode::Error);
    assert!(status.description.contains("partials disagree"), "{}", status.description);
    let mut routes = route_names(&response);
    routes.sort();
    assert_eq!(routes, ["A", "B", "gateway"]);
    assert_eq!(c.calls(), 0);
}
