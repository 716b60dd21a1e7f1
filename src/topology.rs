//! Compiled Flow graph.
//!
//! The graph always carries two synthetic nodes: the entry node, which feeds
//! every deployment without `needs`, and the exit node, whose predecessors'
//! outputs are joined into the response. Node indices follow declaration
//! order (entry first, exit last), which is also the tie-break of the
//! topological order and the order in which joins concatenate partials.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::flow::{DeploymentSpec, EndpointSpec, FlowDescription, MergeStrategy, Polling, ENTRY_NAME};
use crate::request::DEFAULT_ENDPOINT;

pub type NodeId = NodeIndex;

/// Metrics label of endpoints no deployment declares.
pub const OTHER_ENDPOINT: &str = "other";

#[derive(Debug)]
pub enum Node {
    Entry,
    Exit,
    Deployment(Deployment),
}

/// A deployment with its endpoints grouped by shard.
#[derive(Debug)]
pub struct Deployment {
    pub spec: DeploymentSpec,
    /// `shards[shard_id]` lists the replicas of that shard.
    pub shards: Vec<Vec<EndpointSpec>>,
}

impl Deployment {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    fn from_spec(spec: DeploymentSpec) -> Result<Self> {
        if spec.shards == 0 || spec.replicas == 0 {
            return Err(GatewayError::InvalidTopology(format!(
                "deployment `{}` needs at least one shard and one replica",
                spec.name
            )));
        }
        let mut shards = vec![Vec::new(); spec.shards];
        for endpoint in &spec.endpoints {
            let Some(replicas) = shards.get_mut(endpoint.shard_id) else {
                return Err(GatewayError::InvalidTopology(format!(
                    "deployment `{}` has an endpoint for shard {} but only {} shards",
                    spec.name, endpoint.shard_id, spec.shards
                )));
            };
            replicas.push(endpoint.clone());
        }
        if let Some(empty) = shards.iter().position(Vec::is_empty) {
            return Err(GatewayError::InvalidTopology(format!(
                "deployment `{}` has no endpoint for shard {empty}",
                spec.name
            )));
        }
        if spec.polling == Polling::All
            && spec.shards > 1
            && spec.reduce == MergeStrategy::ReducerExec
            && spec.reducer.is_none()
        {
            return Err(GatewayError::InvalidTopology(format!(
                "deployment `{}` reduces its shards with reducer_exec but declares no reducer",
                spec.name
            )));
        }
        Ok(Self { spec, shards })
    }
}

#[derive(Debug)]
pub struct Topology {
    graph: DiGraph<Node, ()>,
    entry: NodeId,
    exit: NodeId,
    successors: Vec<Vec<NodeId>>,
    predecessors: Vec<Vec<NodeId>>,
    topo_order: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
    floating: HashSet<NodeId>,
    exit_reduce: MergeStrategy,
}

impl Topology {
    pub fn build(flow: FlowDescription) -> Result<Self> {
        if flow.exit_reduce == MergeStrategy::ReducerExec {
            return Err(GatewayError::InvalidTopology(
                "the exit join cannot use reducer_exec".into(),
            ));
        }

        let mut graph = DiGraph::new();
        let entry = graph.add_node(Node::Entry);
        let mut by_name = HashMap::new();
        let mut needs = Vec::with_capacity(flow.deployments.len());
        for spec in flow.deployments {
            if spec.name.is_empty() || spec.name == ENTRY_NAME {
                return Err(GatewayError::InvalidTopology(format!(
                    "`{}` is not a valid deployment name",
                    spec.name
                )));
            }
            if by_name.contains_key(&spec.name) {
                return Err(GatewayError::InvalidTopology(format!(
                    "deployment `{}` is declared twice",
                    spec.name
                )));
            }
            let name = spec.name.clone();
            needs.push(spec.needs.clone());
            let idx = graph.add_node(Node::Deployment(Deployment::from_spec(spec)?));
            by_name.insert(name, idx);
        }
        let exit = graph.add_node(Node::Exit);

        let n = graph.node_count();
        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        let mut connect = |graph: &mut DiGraph<Node, ()>,
                           successors: &mut Vec<Vec<NodeId>>,
                           from: NodeId,
                           to: NodeId| {
            if !predecessors[to.index()].contains(&from) {
                graph.add_edge(from, to, ());
                successors[from.index()].push(to);
                predecessors[to.index()].push(from);
            }
        };

        for (i, node_needs) in needs.iter().enumerate() {
            let idx = NodeIndex::new(i + 1);
            if node_needs.is_empty() {
                connect(&mut graph, &mut successors, entry, idx);
            }
            for need in node_needs {
                let from = if need == ENTRY_NAME {
                    entry
                } else {
                    *by_name.get(need).ok_or_else(|| {
                        GatewayError::InvalidTopology(format!(
                            "deployment `{}` needs unknown deployment `{need}`",
                            node_name(&graph, idx)
                        ))
                    })?
                };
                connect(&mut graph, &mut successors, from, idx);
            }
        }

        let exit_preds: Vec<NodeId> = match &flow.exit_needs {
            Some(names) => names
                .iter()
                .map(|name| {
                    by_name.get(name).copied().ok_or_else(|| {
                        GatewayError::InvalidTopology(format!(
                            "exit needs unknown deployment `{name}`"
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => (1..n - 1)
                .map(NodeIndex::new)
                .filter(|idx| successors[idx.index()].is_empty())
                .collect(),
        };
        for pred in exit_preds {
            connect(&mut graph, &mut successors, pred, exit);
        }

        let topo_order = kahn(&successors, &predecessors).map_err(|stuck| {
            let names: Vec<&str> = stuck.iter().map(|idx| node_name(&graph, *idx)).collect();
            GatewayError::InvalidTopology(format!("cycle detected among {}", names.join(", ")))
        })?;

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, entry);
        while let Some(idx) = dfs.next(&graph) {
            reachable.insert(idx);
        }
        for idx in graph.node_indices().filter(|idx| !reachable.contains(idx)) {
            warn!(deployment = node_name(&graph, idx), "deployment is unreachable from the entry and will never run");
        }

        let mut reaches_exit = HashSet::new();
        let reversed = Reversed(&graph);
        let mut dfs = Dfs::new(reversed, exit);
        while let Some(idx) = dfs.next(reversed) {
            reaches_exit.insert(idx);
        }
        let floating = graph
            .node_indices()
            .filter(|idx| *idx != entry && !reaches_exit.contains(idx))
            .collect();

        Ok(Self {
            graph,
            entry,
            exit,
            successors,
            predecessors,
            topo_order,
            by_name,
            floating,
            exit_reduce: flow.exit_reduce,
        })
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn exit(&self) -> NodeId {
        self.exit
    }

    pub fn node(&self, idx: NodeId) -> &Node {
        &self.graph[idx]
    }

    pub fn deployment(&self, idx: NodeId) -> Option<&Deployment> {
        match &self.graph[idx] {
            Node::Deployment(dep) => Some(dep),
            _ => None,
        }
    }

    pub fn deployments(&self) -> impl Iterator<Item = (NodeId, &Deployment)> + '_ {
        self.graph.node_indices().filter_map(move |idx| match &self.graph[idx] {
            Node::Deployment(dep) => Some((idx, dep)),
            _ => None,
        })
    }

    pub fn name(&self, idx: NodeId) -> &str {
        node_name(&self.graph, idx)
    }

    pub fn index_of(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Downstream neighbours in declaration order.
    pub fn successors(&self, idx: NodeId) -> &[NodeId] {
        &self.successors[idx.index()]
    }

    /// Upstream neighbours in `needs` order.
    pub fn predecessors(&self, idx: NodeId) -> &[NodeId] {
        &self.predecessors[idx.index()]
    }

    pub fn is_join(&self, idx: NodeId) -> bool {
        self.predecessors[idx.index()].len() > 1
    }

    pub fn join_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices().filter(move |idx| self.is_join(*idx))
    }

    pub fn entry_successors(&self) -> &[NodeId] {
        self.successors(self.entry)
    }

    pub fn exit_predecessors(&self) -> &[NodeId] {
        self.predecessors(self.exit)
    }

    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    /// Nodes without a path to the exit. They run, but nobody awaits them.
    pub fn is_floating(&self, idx: NodeId) -> bool {
        self.floating.contains(&idx)
    }

    /// `endpoint` as a metrics label. Endpoints a deployment declares, and
    /// `/default`, keep their name; anything else a client invents is
    /// folded into `other`.
    pub fn endpoint_label<'a>(&self, endpoint: &'a str) -> &'a str {
        let declared = endpoint == DEFAULT_ENDPOINT
            || self.deployments().any(|(_, dep)| {
                dep.spec.handles.iter().flatten().any(|h| h == endpoint)
                    || dep.spec.write_endpoints.iter().any(|e| e == endpoint)
            });
        if declared {
            endpoint
        } else {
            OTHER_ENDPOINT
        }
    }

    /// Merge used when `idx` joins several partials.
    pub fn merge_strategy(&self, idx: NodeId) -> MergeStrategy {
        match &self.graph[idx] {
            Node::Deployment(dep) => dep.spec.reduce,
            Node::Exit => self.exit_reduce,
            Node::Entry => MergeStrategy::ConcatDocs,
        }
    }
}

fn node_name(graph: &DiGraph<Node, ()>, idx: NodeId) -> &str {
    match &graph[idx] {
        Node::Entry => "__entry__",
        Node::Exit => "__exit__",
        Node::Deployment(dep) => dep.name(),
    }
}

/// Kahn's algorithm; ready nodes are taken lowest index first. On a cycle
/// the nodes that never became ready are returned.
fn kahn(
    successors: &[Vec<NodeId>],
    predecessors: &[Vec<NodeId>],
) -> std::result::Result<Vec<NodeId>, Vec<NodeId>> {
    let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(NodeIndex::new(i));
        for succ in &successors[i] {
            let d = &mut in_degree[succ.index()];
            *d -= 1;
            if *d == 0 {
                ready.push(Reverse(succ.index()));
            }
        }
    }
    if order.len() == in_degree.len() {
        Ok(order)
    } else {
        Err(in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| NodeIndex::new(i))
            .collect())
    }
}
