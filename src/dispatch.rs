//! One hop of a request: picking shards and replicas, calling the executor,
//! retrying transient failures and merging shard responses.
//!
//! The dispatcher never fails a hop with an `Err`. Whatever goes wrong ends
//! up in the status of the request it returns, so that the traversal can
//! treat executor errors and gateway errors alike.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use prost_types::value::Kind;
use prost_types::{Struct, Value};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::flow::{MergeStrategy, Polling};
use crate::metrics::GatewayMetrics;
use crate::net::error::code_name;
use crate::net::pool::wait_for_change;
use crate::net::{ConnectionPool, Lease, TransportError};
use crate::params::{get_str, has_specific_params, specific_params, RESULTS_KEY, SHARD_KEY};
use crate::proto::{JinaDataRequestRpcClient, JinaSingleDataRequestRpcClient, RouteProto, StatusProto};
use crate::reduce::{concat_docs, slot_routes, Reducers, Slot};
use crate::request::{DataRequest, DataRequestList};
use crate::topology::{Deployment, NodeId, Topology};

/// Resolves the current leader of a stateful shard, as `host:port`.
pub trait LeaderResolver: Send + Sync {
    fn leader(&self, deployment: &str, shard: usize) -> Option<String>;
}

/// Result of offering a join's partials to the join node.
#[derive(Debug)]
pub enum JoinOutcome {
    /// Merged locally; the node still has to process the merged request.
    Merged(DataRequest),
    /// The node already ran, reducing the partials itself.
    Reduced(DataRequest),
}

#[derive(Debug, Clone)]
enum Payload {
    Single(DataRequest),
    List(DataRequestList),
}

pub struct Dispatcher {
    topology: Arc<Topology>,
    pool: Arc<ConnectionPool>,
    config: GatewayConfig,
    metrics: GatewayMetrics,
    reducers: Reducers,
    leader: Option<Arc<dyn LeaderResolver>>,
    /// Round-robin cursor per node, for ANY shard selection.
    shard_rr: Vec<AtomicUsize>,
    /// Round-robin cursor per node, for replica tie-breaks.
    replica_rr: Vec<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        topology: Arc<Topology>,
        pool: Arc<ConnectionPool>,
        config: GatewayConfig,
        metrics: GatewayMetrics,
    ) -> Self {
        let n = topology.node_count();
        Self {
            topology,
            pool,
            config,
            metrics,
            reducers: Reducers::default(),
            leader: None,
            shard_rr: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            replica_rr: (0..n).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn with_reducers(mut self, reducers: Reducers) -> Self {
        self.reducers = reducers;
        self
    }

    pub fn with_leader_resolver(mut self, leader: Arc<dyn LeaderResolver>) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn reducers(&self) -> &Reducers {
        &self.reducers
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Whether `node` would process `request`, or let it through untouched.
    pub fn visits(&self, node: NodeId, request: &DataRequest, target: Option<&Regex>) -> bool {
        let Some(dep) = self.topology.deployment(node) else {
            return false;
        };
        if target.is_some_and(|re| !re.is_match(dep.name())) {
            return false;
        }
        match request.exec_endpoint() {
            Ok(endpoint) => dep.spec.binds(endpoint),
            Err(_) => true,
        }
    }

    /// Sends `request` through `node`.
    pub async fn dispatch(&self, node: NodeId, request: DataRequest, target: Option<&Regex>) -> DataRequest {
        if !self.visits(node, &request, target) {
            return request;
        }
        let Some(dep) = self.topology.deployment(node) else {
            return request;
        };
        let span = debug_span!("hop", deployment = dep.name());
        self.dispatch_deployment(node, dep, request).instrument(span).await
    }

    async fn dispatch_deployment(&self, node: NodeId, dep: &Deployment, request: DataRequest) -> DataRequest {
        let (outgoing, rewritten) = match self.outgoing(dep, &request) {
            Ok(outgoing) => outgoing,
            Err(e) => return fail(request, &e),
        };

        let shards = dep.shards.len();
        let response = if dep.spec.polling == Polling::All && shards > 1 {
            let calls = (0..shards).map(|shard| {
                self.call_shard(node, dep, shard, Payload::Single(outgoing.clone()), &outgoing)
            });
            let responses = join_all(calls).await;
            let slots = responses
                .into_iter()
                .enumerate()
                .map(|(shard, response)| Slot::arrived(format!("{}[{shard}]", dep.name()), response))
                .collect();
            self.merge_shards(dep, slots, &outgoing).await
        } else {
            let shard = self.pick_shard(node, dep, &outgoing);
            self.call_shard(node, dep, shard, Payload::Single(outgoing.clone()), &outgoing)
                .await
        };

        if rewritten {
            restore_parameters(&request, response)
        } else {
            response
        }
    }

    /// The request as this deployment should see it: executor-specific
    /// parameters resolved. Untouched when there are none; the flag tells
    /// whether the parameters were rewritten.
    fn outgoing(&self, dep: &Deployment, request: &DataRequest) -> Result<(DataRequest, bool)> {
        let body = request.body()?;
        let Some(params) = &body.parameters else {
            return Ok((request.clone(), false));
        };
        if !has_specific_params(params, |key| self.topology.index_of(key).is_some()) {
            return Ok((request.clone(), false));
        }
        let resolved = specific_params(params, dep.name());
        let mut outgoing = request.clone();
        outgoing.body_mut()?.parameters = Some(resolved);
        Ok((outgoing, true))
    }

    fn pick_shard(&self, node: NodeId, dep: &Deployment, request: &DataRequest) -> usize {
        let shards = dep.shards.len();
        if shards == 1 {
            return 0;
        }
        let key = request
            .body()
            .ok()
            .and_then(|b| b.parameters.as_ref())
            .and_then(|p| get_str(p, SHARD_KEY));
        match key {
            Some(key) => (shard_hash(key) % shards as u64) as usize,
            None => self.shard_rr[node.index()].fetch_add(1, Ordering::Relaxed) % shards,
        }
    }

    async fn merge_shards(
        &self,
        dep: &Deployment,
        slots: Vec<Slot>,
        input: &DataRequest,
    ) -> DataRequest {
        let strategy = dep.spec.reduce;
        let any_failed = slots
            .iter()
            .any(|s| s.partial.as_ref().map_or(true, |p| p.is_error().unwrap_or(true)));
        let merged = match (strategy, &dep.spec.reducer) {
            (MergeStrategy::ReducerExec, Some(reducer)) if !any_failed => {
                let list = DataRequestList::new(slots.into_iter().filter_map(|s| s.partial).collect());
                let address = reducer.address();
                let pod_id = format!("{}/reducer@{address}", dep.name());
                return self
                    .call_address(dep, &address, &pod_id, Payload::List(list), input)
                    .await;
            }
            (MergeStrategy::ReducerExec, _) => concat_docs(slots),
            (strategy, _) => self.reducers.merge(dep.name(), strategy, slots),
        };
        merged.unwrap_or_else(|e| fail(input.clone(), &e))
    }

    /// Offers the partials meeting at `node` to it. `reducer_exec` joins send
    /// them to the node's executor as one list; every other join merges
    /// locally and leaves the merged request for [`Dispatcher::dispatch`].
    pub async fn join(&self, node: NodeId, slots: Vec<Slot>, target: Option<&Regex>) -> JoinOutcome {
        let name = self.topology.name(node).to_string();
        let strategy = self.topology.merge_strategy(node);
        let dep = self.topology.deployment(node);

        if strategy == MergeStrategy::ReducerExec {
            if let Some(dep) = dep {
                let missing: Vec<&str> = slots
                    .iter()
                    .filter(|s| s.partial.is_none())
                    .map(|s| s.from.as_str())
                    .collect();
                if !missing.is_empty() {
                    let description = format!(
                        "deadline exceeded: join `{name}` is missing {}",
                        missing.join(", ")
                    );
                    let merged = concat_docs(slots).unwrap_or_default();
                    return JoinOutcome::Reduced(with_status(merged, StatusProto::error(description)));
                }
                let any_failed = slots
                    .iter()
                    .filter_map(|s| s.partial.as_ref())
                    .any(|p| p.is_error().unwrap_or(true));
                let visits = slots
                    .iter()
                    .filter_map(|s| s.partial.as_ref())
                    .next()
                    .is_some_and(|first| self.visits(node, first, target));
                if !any_failed && visits {
                    let Some(input) = slots.iter().find_map(|s| s.partial.clone()) else {
                        return JoinOutcome::Merged(DataRequest::default());
                    };
                    let list = DataRequestList::new(slots.into_iter().filter_map(|s| s.partial).collect());
                    let shard = self.pick_shard(node, dep, &input);
                    let span = debug_span!("join", deployment = name.as_str());
                    let reduced = self
                        .call_shard(node, dep, shard, Payload::List(list), &input)
                        .instrument(span)
                        .await;
                    return JoinOutcome::Reduced(reduced);
                }
            }
            let routes = slot_routes(&slots);
            return JoinOutcome::Merged(concat_docs(slots).unwrap_or_else(|e| failed_merge(routes, &e)));
        }

        let routes = slot_routes(&slots);
        match self.reducers.merge(&name, strategy, slots) {
            Ok(merged) => JoinOutcome::Merged(merged),
            Err(e) => {
                warn!(join = name.as_str(), "merge failed: {e}");
                JoinOutcome::Merged(failed_merge(routes, &e))
            }
        }
    }

    fn retries(&self, dep: &Deployment) -> usize {
        dep.spec.retries.unwrap_or(self.config.max_retries)
    }

    fn send_timeout(&self, dep: &Deployment) -> Duration {
        dep.spec
            .timeout_send_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.send_timeout)
    }

    /// Calls one shard, retrying transient failures on other replicas.
    async fn call_shard(
        &self,
        node: NodeId,
        dep: &Deployment,
        shard: usize,
        payload: Payload,
        input: &DataRequest,
    ) -> DataRequest {
        let is_write = input
            .exec_endpoint()
            .map(|endpoint| dep.spec.is_write(endpoint))
            .unwrap_or(false);
        let retries = self.retries(dep);
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        let mut last_route: Option<RouteProto> = None;

        for attempt in 0..=retries {
            let picked = if is_write {
                self.pick_leader(dep, shard).await
            } else {
                self.pick_replica(node, dep, shard, &tried).await
            };
            let (lease, pod_id) = match picked {
                Ok(picked) => picked,
                Err(e) => {
                    debug!(shard, attempt, "no replica: {e}");
                    let retryable = is_retryable(&e);
                    last_error = Some(e);
                    if retryable {
                        continue;
                    }
                    break;
                }
            };
            let address = lease.address();
            match self.call_lease(dep, lease, &pod_id, payload.clone()).await {
                Ok(response) => return attribute_results(dep.name(), input, response),
                Err((e, route)) => {
                    last_route = Some(route);
                    if e.not_leader() {
                        debug!(address, "replica is not the leader, resolving again");
                    } else if e.is_retryable() {
                        debug!(address, attempt, "retrying after transient failure: {e}");
                        self.pool.report_failure(&address, &e);
                    } else {
                        let mut failed = fail(input.clone(), &GatewayError::Transport(e));
                        if let Some(route) = last_route {
                            failed.add_route(route);
                        }
                        return failed;
                    }
                    tried.push(address);
                    last_error = Some(GatewayError::Transport(e));
                }
            }
        }

        let error = last_error.unwrap_or_else(|| GatewayError::NoAvailableReplica {
            deployment: dep.name().to_string(),
            shard,
        });
        warn!(shard, "giving up after {} attempts: {error}", retries + 1);
        let mut failed = fail(input.clone(), &error);
        if let Some(route) = last_route {
            failed.add_route(route);
        }
        failed
    }

    /// Calls a fixed address, waiting for it to become ready like any replica.
    async fn call_address(
        &self,
        dep: &Deployment,
        address: &str,
        pod_id: &str,
        payload: Payload,
        input: &DataRequest,
    ) -> DataRequest {
        let lease = match self.acquire_waiting(address).await {
            Ok(lease) => lease,
            Err(e) => return fail(input.clone(), &e),
        };
        match self.call_lease(dep, lease, pod_id, payload).await {
            Ok(response) => attribute_results(dep.name(), input, response),
            Err((e, route)) => {
                let mut failed = fail(input.clone(), &GatewayError::Transport(e));
                failed.add_route(route);
                failed
            }
        }
    }

    /// One RPC. Successful responses get their route appended; failures
    /// return the route so the caller can record the attempt.
    async fn call_lease(
        &self,
        dep: &Deployment,
        lease: Lease,
        pod_id: &str,
        payload: Payload,
    ) -> std::result::Result<DataRequest, (TransportError, RouteProto)> {
        let route = RouteProto::begin(dep.name(), pod_id);
        let started = Instant::now();
        let timeout = self.send_timeout(dep);
        let result = self.rpc(&lease, payload, timeout).await;
        drop(lease);
        let route = route.finish();

        let label = match &result {
            Ok(response) => response
                .body()
                .map(|b| b.status_code().as_str_name())
                .unwrap_or("MALFORMED"),
            Err(e) => code_name(e.code()),
        };
        self.metrics
            .record_executor_call(dep.name(), label, started.elapsed());

        match result {
            Ok(mut response) => {
                response.add_route(route);
                Ok(response)
            }
            Err(e) => Err((e, route)),
        }
    }

    async fn rpc(
        &self,
        lease: &Lease,
        payload: Payload,
        timeout: Duration,
    ) -> std::result::Result<DataRequest, TransportError> {
        let address = lease.address();
        let call = async {
            match payload {
                Payload::Single(request) => {
                    let mut client = JinaSingleDataRequestRpcClient::new(lease.channel.clone())
                        .max_decoding_message_size(usize::MAX)
                        .max_encoding_message_size(usize::MAX);
                    if let Some(compression) = self.config.compression {
                        client = client
                            .send_compressed(compression.encoding())
                            .accept_compressed(compression.encoding());
                    }
                    let mut request = tonic::Request::new(request);
                    request.set_timeout(timeout);
                    client.process_single_data(request).await
                }
                Payload::List(list) => {
                    let mut client = JinaDataRequestRpcClient::new(lease.channel.clone())
                        .max_decoding_message_size(usize::MAX)
                        .max_encoding_message_size(usize::MAX);
                    if let Some(compression) = self.config.compression {
                        client = client
                            .send_compressed(compression.encoding())
                            .accept_compressed(compression.encoding());
                    }
                    let mut request = tonic::Request::new(list);
                    request.set_timeout(timeout);
                    client.process_data(request).await
                }
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(TransportError::status(address, status)),
            Err(_) => Err(TransportError::Timeout(address)),
        }
    }

    /// The least loaded READY replica of `shard`, ties broken round-robin.
    /// Replicas in `tried` are avoided while another one is ready. Waits up
    /// to `replica_wait` for a probe to promote one.
    async fn pick_replica(
        &self,
        node: NodeId,
        dep: &Deployment,
        shard: usize,
        tried: &[String],
    ) -> Result<(Lease, String)> {
        let replicas = &dep.shards[shard];
        let deadline = Instant::now() + self.config.replica_wait;
        let mut updates = self.pool.subscribe();
        loop {
            let snapshot = updates.borrow_and_update().clone();
            let ready: Vec<_> = replicas
                .iter()
                .filter(|r| snapshot.is_ready(&r.address()))
                .collect();
            let fresh: Vec<_> = ready
                .iter()
                .copied()
                .filter(|r| !tried.contains(&r.address()))
                .collect();
            let mut candidates = if fresh.is_empty() { ready } else { fresh };

            if !candidates.is_empty() {
                let start = self.replica_rr[node.index()].fetch_add(1, Ordering::Relaxed);
                let len = candidates.len();
                candidates.rotate_left(start % len);
                // stable sort keeps the rotated order among equals
                candidates.sort_by_key(|r| self.pool.outstanding(&r.address()));
                let mut overloaded = None;
                for replica in candidates {
                    let address = replica.address();
                    match self.pool.acquire(&address) {
                        Ok(lease) => {
                            let pod_id = format!(
                                "{}/{shard}/{}@{address}",
                                dep.name(),
                                replica.replica_id
                            );
                            return Ok((lease, pod_id));
                        }
                        Err(e @ TransportError::Overloaded(_)) => overloaded = Some(e),
                        Err(e) => debug!(address, "replica vanished from snapshot: {e}"),
                    }
                }
                if let Some(e) = overloaded {
                    return Err(GatewayError::ResourceExhausted(e.to_string()));
                }
            }

            let now = Instant::now();
            if now >= deadline || !wait_for_change(&mut updates, deadline - now).await {
                return Err(GatewayError::NoAvailableReplica {
                    deployment: dep.name().to_string(),
                    shard,
                });
            }
        }
    }

    async fn pick_leader(&self, dep: &Deployment, shard: usize) -> Result<(Lease, String)> {
        let leader = self
            .leader
            .as_ref()
            .and_then(|resolver| resolver.leader(dep.name(), shard));
        let Some(address) = leader else {
            return Err(GatewayError::NoAvailableReplica {
                deployment: dep.name().to_string(),
                shard,
            });
        };
        let lease = self.acquire_waiting(&address).await?;
        Ok((lease, format!("{}/{shard}/leader@{address}", dep.name())))
    }

    async fn acquire_waiting(&self, address: &str) -> Result<Lease> {
        let deadline = Instant::now() + self.config.replica_wait;
        let mut updates = self.pool.subscribe();
        loop {
            updates.borrow_and_update();
            match self.pool.acquire(address) {
                Ok(lease) => return Ok(lease),
                Err(e @ TransportError::Overloaded(_)) => {
                    return Err(GatewayError::ResourceExhausted(e.to_string()))
                }
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline || !wait_for_change(&mut updates, deadline - now).await {
                        return Err(GatewayError::Transport(e));
                    }
                }
            }
        }
    }
}

fn is_retryable(error: &GatewayError) -> bool {
    match error {
        GatewayError::NoAvailableReplica { .. } => true,
        GatewayError::Transport(e) => e.is_retryable() || e.not_leader(),
        _ => false,
    }
}

/// Files the `__results__` value an executor returned under the executor's
/// name, next to the results collected upstream.
fn attribute_results(executor: &str, input: &DataRequest, mut response: DataRequest) -> DataRequest {
    let results_of = |request: &DataRequest| {
        request
            .body()
            .ok()
            .and_then(|b| b.parameters.as_ref())
            .and_then(|p| p.fields.get(RESULTS_KEY))
            .cloned()
    };
    let Some(returned) = results_of(&response) else {
        return response;
    };
    let upstream = results_of(input);
    if upstream.as_ref() == Some(&returned) {
        return response;
    }
    let mut results = match upstream {
        Some(Value {
            kind: Some(Kind::StructValue(results)),
        }) => results,
        _ => Struct::default(),
    };
    results.fields.insert(executor.to_string(), returned);
    if let Ok(body) = response.body_mut() {
        body.parameters_mut().fields.insert(
            RESULTS_KEY.to_string(),
            Value {
                kind: Some(Kind::StructValue(results)),
            },
        );
    }
    response
}

/// Puts the parameters `request` carried before they were resolved for one
/// executor back on `response`, so downstream executors see every specific
/// key. Collected `__results__` survive.
fn restore_parameters(request: &DataRequest, mut response: DataRequest) -> DataRequest {
    let Some(mut parameters) = request.body().ok().and_then(|b| b.parameters.clone()) else {
        return response;
    };
    let Ok(body) = response.body_mut() else {
        return response;
    };
    if let Some(results) = body.parameters.as_mut().and_then(|p| p.fields.remove(RESULTS_KEY)) {
        parameters.fields.insert(RESULTS_KEY.to_string(), results);
    }
    body.parameters = Some(parameters);
    response
}

/// Stable 64-bit hash of a shard key.
pub fn shard_hash(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

fn with_status(mut request: DataRequest, status: StatusProto) -> DataRequest {
    match request.body_mut() {
        Ok(body) => {
            body.status = Some(status);
            request
        }
        Err(_) => DataRequest::failed("", "", status),
    }
}

/// A join whose merge failed, still listing the routes of its partials.
fn failed_merge(routes: Vec<RouteProto>, error: &GatewayError) -> DataRequest {
    let mut failed = DataRequest::failed("", "", error.to_status_proto());
    if let Ok(body) = failed.body_mut() {
        body.routes = routes;
    }
    failed
}

/// `input` answered with an ERROR status describing `error`.
pub(crate) fn fail(input: DataRequest, error: &GatewayError) -> DataRequest {
    let code = code_name(error.to_status().code());
    let mut status = StatusProto::error(format!("{code}: {}", error.client_message()));
    status.exception = error.to_status_proto().exception;
    with_status(input, status)
}
