//! The walk of one request through the Flow.
//!
//! Every node waits for one partial per predecessor. Nodes whose slots are
//! full start right away, so independent branches run concurrently; the walk
//! awaits whichever hop finishes next and feeds its output downstream. A
//! request that carries an error status is no longer dispatched but still
//! flows on, so that joins and the exit see the failed branch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use prost_types::{Struct, Timestamp};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, debug_span, warn, Instrument};

use crate::dispatch::{fail, Dispatcher, JoinOutcome};
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::params::{get_number, DEADLINE_MS, RESULTS_KEY};
use crate::proto::{RouteProto, StatusProto};
use crate::reduce::{union_routes, Slot};
use crate::request::routes::{now, GATEWAY_ROUTE};
use crate::request::DataRequest;
use crate::topology::{NodeId, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Dispatching,
    AwaitingJoins,
    Complete,
    Errored,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Errored | Phase::Cancelled)
    }

    fn allows(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Received, Dispatching) => true,
            (Dispatching, AwaitingJoins) | (AwaitingJoins, Dispatching) => true,
            (from, Complete | Errored | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Lifecycle of one request. Transitions the table does not allow are
/// dropped and counted.
#[derive(Debug)]
pub struct RequestState {
    phase: Phase,
    metrics: GatewayMetrics,
}

impl RequestState {
    pub fn new(metrics: GatewayMetrics) -> Self {
        Self {
            phase: Phase::Received,
            metrics,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves to `to`, returning false if the move was illegal.
    pub fn advance(&mut self, to: Phase) -> bool {
        if self.phase == to {
            return true;
        }
        if !self.phase.allows(to) {
            debug!(from = ?self.phase, to = ?to, "dropping illegal transition");
            self.metrics.illegal_transition();
            return false;
        }
        self.phase = to;
        true
    }

    /// Counts a hop that finished after the request was cancelled. Its
    /// output is dropped.
    pub fn drop_late_completion(&self) {
        debug!(phase = ?self.phase, "dropping a late hop completion");
        self.metrics.illegal_transition();
    }
}

/// What the gateway remembers about a request from ingress until egress.
struct Ingress {
    request_id: String,
    exec_endpoint: String,
    parameters: Option<Struct>,
    target: Option<Regex>,
    deadline: Option<Duration>,
    gateway_start: Option<Timestamp>,
}

impl Ingress {
    fn accept(request: &mut DataRequest) -> Result<Self> {
        let request_id = request.ensure_request_id()?;
        let exec_endpoint = request.exec_endpoint()?.to_string();
        let body = request.body()?;
        let parameters = body.parameters.clone();
        let target = match body.target_executor.as_str() {
            "" => None,
            pattern => Some(Regex::new(&format!("^(?:{pattern})")).map_err(|e| {
                GatewayError::BadRequest(format!("invalid target_executor `{pattern}`: {e}"))
            })?),
        };
        let deadline = parameters
            .as_ref()
            .and_then(|p| get_number(p, DEADLINE_MS))
            .filter(|ms| *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64));

        let route = RouteProto::begin(GATEWAY_ROUTE, GATEWAY_ROUTE);
        let gateway_start = route.start_time.clone();
        request.add_route(route);

        Ok(Self {
            request_id,
            exec_endpoint,
            parameters,
            target,
            deadline,
            gateway_start,
        })
    }

    /// Restores what the client sent on `response`: its id, its parameters
    /// plus the collected results, and closes the gateway route.
    fn egress(&self, response: &mut DataRequest) -> Result<()> {
        let body = response.body_mut()?;
        if body.request_id() != self.request_id {
            body.set_request_id(self.request_id.clone());
        }
        if body.exec_endpoint.is_empty() {
            body.exec_endpoint = self.exec_endpoint.clone();
        }

        let results = body
            .parameters
            .as_mut()
            .and_then(|p| p.fields.remove(RESULTS_KEY));
        let mut parameters = self.parameters.clone();
        if let Some(results) = results {
            parameters
                .get_or_insert_with(Default::default)
                .fields
                .insert(RESULTS_KEY.to_string(), results);
        }
        body.parameters = parameters;

        match body
            .routes
            .iter_mut()
            .find(|r| r.is_gateway() && r.end_time.is_none())
        {
            Some(route) => route.end_time = Some(now()),
            None => body.routes.insert(
                0,
                RouteProto {
                    executor: GATEWAY_ROUTE.to_string(),
                    start_time: self.gateway_start.clone(),
                    end_time: Some(now()),
                    pod_id: GATEWAY_ROUTE.to_string(),
                },
            ),
        }
        Ok(())
    }
}

type Hop = BoxFuture<'static, (NodeId, DataRequest)>;

/// Slots and running hops of one request.
struct Walk {
    dispatcher: Arc<Dispatcher>,
    topology: Arc<Topology>,
    target: Option<Regex>,
    slots: Vec<Vec<Option<DataRequest>>>,
    pending: Vec<usize>,
    /// Joins holding some but not all of their partials.
    partial_joins: usize,
    running: FuturesUnordered<Hop>,
    /// Routes of every hop output seen so far, kept when a deadline may cut
    /// the walk short.
    seen_routes: Option<Vec<RouteProto>>,
}

impl Walk {
    fn new(dispatcher: Arc<Dispatcher>, target: Option<Regex>, track_routes: bool) -> Self {
        let topology = dispatcher.topology().clone();
        let n = topology.node_count();
        let mut slots = vec![Vec::new(); n];
        let mut pending = vec![0; n];
        for &node in topology.topo_order() {
            let k = topology.predecessors(node).len();
            slots[node.index()] = vec![None; k];
            pending[node.index()] = k;
        }
        Self {
            dispatcher,
            topology,
            target,
            slots,
            pending,
            partial_joins: 0,
            running: FuturesUnordered::new(),
            seen_routes: track_routes.then(Vec::new),
        }
    }

    /// Hands `output` of `from` to every successor and starts those that
    /// became ready. Returns the exit's slots once the exit is ready.
    fn deliver(&mut self, from: NodeId, output: DataRequest) -> Option<Vec<Slot>> {
        if let (Some(seen), Ok(body)) = (&mut self.seen_routes, output.body()) {
            seen.extend(body.routes.iter().cloned());
        }
        let topology = self.topology.clone();
        let exit = topology.exit();
        let mut exit_ready = None;
        for &to in topology.successors(from) {
            let Some(pos) = topology.predecessors(to).iter().position(|p| *p == from) else {
                continue;
            };
            let i = to.index();
            if self.slots[i][pos].is_some() || self.pending[i] == 0 {
                warn!(node = topology.name(to), "ignoring a second partial from `{}`", topology.name(from));
                continue;
            }
            self.slots[i][pos] = Some(output.clone());
            let k = self.slots[i].len();
            self.pending[i] -= 1;
            if k > 1 && self.pending[i] == k - 1 {
                self.partial_joins += 1;
            }
            if self.pending[i] > 0 {
                continue;
            }
            if k > 1 {
                self.partial_joins -= 1;
            }
            if to == exit {
                exit_ready = Some(self.take_slots(to));
            } else {
                self.start(to);
            }
        }
        exit_ready
    }

    fn take_slots(&mut self, node: NodeId) -> Vec<Slot> {
        let topology = &self.topology;
        topology
            .predecessors(node)
            .iter()
            .zip(self.slots[node.index()].iter_mut())
            .map(|(pred, slot)| Slot {
                from: topology.name(*pred).to_string(),
                partial: slot.take(),
            })
            .collect()
    }

    fn start(&mut self, node: NodeId) {
        let slots = self.take_slots(node);
        let is_join = self.topology.is_join(node);
        let dispatcher = self.dispatcher.clone();
        let target = self.target.clone();
        self.running.push(
            async move {
                let input = if is_join {
                    match dispatcher.join(node, slots, target.as_ref()).await {
                        JoinOutcome::Reduced(done) => return (node, done),
                        JoinOutcome::Merged(merged) => merged,
                    }
                } else {
                    slots
                        .into_iter()
                        .find_map(|s| s.partial)
                        .unwrap_or_default()
                };
                if input.is_error().unwrap_or(true) {
                    return (node, input);
                }
                (node, dispatcher.dispatch(node, input, target.as_ref()).await)
            }
            .boxed(),
        );
    }

    fn phase(&self) -> Phase {
        if self.partial_joins > 0 {
            Phase::AwaitingJoins
        } else {
            Phase::Dispatching
        }
    }

    /// Runs the hops still in flight after the response left. Only floating
    /// deployments can be left at that point.
    async fn finish_floating(mut self) {
        while let Some((node, output)) = self.running.next().await {
            debug!(deployment = self.topology.name(node), "floating hop done");
            self.deliver(node, output);
        }
    }
}

/// Walks `request` through the Flow and returns the egress response.
pub(crate) async fn traverse(dispatcher: Arc<Dispatcher>, mut request: DataRequest) -> DataRequest {
    let started = Instant::now();
    let metrics = dispatcher.metrics().clone();
    let mut state = RequestState::new(metrics.clone());

    let (mut response, ingress) = match Ingress::accept(&mut request) {
        Ok(ingress) => {
            let span = debug_span!("request", request_id = ingress.request_id.as_str());
            let response = walk(&dispatcher, request, &ingress, &mut state)
                .instrument(span)
                .await;
            (response, Some(ingress))
        }
        Err(e) => {
            debug!("rejecting request: {e}");
            let id = request.request_id().unwrap_or_default().to_string();
            let endpoint = request.exec_endpoint().unwrap_or_default().to_string();
            (DataRequest::failed(&id, &endpoint, e.to_status_proto()), None)
        }
    };

    if let Some(ingress) = &ingress {
        if let Err(e) = ingress.egress(&mut response) {
            warn!("could not finalize response: {e}");
            response = DataRequest::failed(
                &ingress.request_id,
                &ingress.exec_endpoint,
                e.to_status_proto(),
            );
        }
    }

    let (endpoint, code) = match response.body() {
        Ok(body) => (
            body.exec_endpoint.clone(),
            body.status_code().as_str_name(),
        ),
        Err(_) => (String::new(), "MALFORMED"),
    };
    if !state.phase().is_terminal() {
        let done = if response.is_error().unwrap_or(true) {
            Phase::Errored
        } else {
            Phase::Complete
        };
        state.advance(done);
    }
    let label = dispatcher.topology().endpoint_label(&endpoint);
    metrics.record_request(label, code, started.elapsed());
    response
}

async fn walk(
    dispatcher: &Arc<Dispatcher>,
    request: DataRequest,
    ingress: &Ingress,
    state: &mut RequestState,
) -> DataRequest {
    let topology = dispatcher.topology().clone();
    let exit = topology.exit();
    if topology.exit_predecessors().is_empty() {
        return request;
    }

    let mut walk = Walk::new(dispatcher.clone(), ingress.target.clone(), ingress.deadline.is_some());
    state.advance(Phase::Dispatching);
    let mut ready = walk.deliver(topology.entry(), request);

    let timer = async {
        match ingress.deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timer);

    let mut expired: Option<Vec<String>> = None;
    let exit_slots = loop {
        if let Some(slots) = ready.take() {
            break slots;
        }
        tokio::select! {
            hop = walk.running.next() => match hop {
                Some((node, output)) => {
                    ready = walk.deliver(node, output);
                    state.advance(walk.phase());
                }
                None => {
                    warn!("nothing left to run but the exit is not ready");
                    break walk.take_slots(exit);
                }
            },
            _ = &mut timer => {
                debug!("deadline elapsed, merging what arrived");
                let slots = walk.take_slots(exit);
                expired = Some(
                    slots
                        .iter()
                        .filter(|s| s.partial.is_none())
                        .map(|s| format!("`{}`", s.from))
                        .collect::<Vec<_>>(),
                );
                break slots;
            }
        }
    };

    let response = if exit_slots.len() == 1 && exit_slots[0].partial.is_some() {
        exit_slots
            .into_iter()
            .find_map(|s| s.partial)
            .unwrap_or_default()
    } else {
        match dispatcher.join(exit, exit_slots, ingress.target.as_ref()).await {
            JoinOutcome::Merged(merged) | JoinOutcome::Reduced(merged) => merged,
        }
    };

    if let Some(missing) = expired {
        state.advance(Phase::Cancelled);
        // hops that finished while the timer fired arrive too late
        while let Some(Some(_)) = walk.running.next().now_or_never() {
            state.drop_late_completion();
        }
        let deadline = ingress.deadline.unwrap_or_default();
        let error = GatewayError::Timeout(format!(
            "{} ms elapsed before {} answered",
            deadline.as_millis(),
            missing.join(", ")
        ));
        let mut response = fail(response, &error);
        if let (Some(seen), Ok(body)) = (&walk.seen_routes, response.body_mut()) {
            let routes = union_routes(body.routes.iter().chain(seen));
            body.routes = routes;
        }
        return response;
    }
    if !walk.running.is_empty() {
        tokio::spawn(walk.finish_floating().in_current_span());
    }
    response
}

/// An `ERROR` response for a request that never completed.
pub(crate) fn unresolved(request_id: &str, exec_endpoint: &str, error: &GatewayError) -> DataRequest {
    let mut status = StatusProto::error(error.client_message());
    status.exception = error.to_status_proto().exception;
    DataRequest::failed(request_id, exec_endpoint, status)
}
