//! Parsed Flow descriptions, as handed to the gateway by whoever reads the
//! user's YAML. Nothing here is validated; [`crate::topology::Topology`]
//! does that when it compiles the description.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name accepted in `needs` for the implicit entry node.
pub const ENTRY_NAME: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Polling {
    /// Send each request to exactly one shard.
    #[default]
    Any,
    /// Broadcast to every shard and join the responses.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    ConcatDocs,
    ReducerExec,
    FirstNonEmpty,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::ConcatDocs => "concat_docs",
            MergeStrategy::ReducerExec => "reducer_exec",
            MergeStrategy::FirstNonEmpty => "first_non_empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Grpc,
    Grpcs,
}

/// One executor replica of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub shard_id: usize,
    #[serde(default)]
    pub replica_id: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EndpointSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Grpc,
            shard_id: 0,
            replica_id: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_shard(mut self, shard_id: usize, replica_id: usize) -> Self {
        self.shard_id = shard_id;
        self.replica_id = replica_id;
        self
    }

    pub fn uri(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Grpc => "http",
            Protocol::Grpcs => "https",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// `host:port`, the key the connection pool indexes channels by.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn one() -> usize {
    1
}

/// One node of the Flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    #[serde(default = "one")]
    pub shards: usize,
    #[serde(default = "one")]
    pub replicas: usize,
    #[serde(default)]
    pub polling: Polling,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    /// Predecessors. Empty (or [`ENTRY_NAME`]) attaches to the entry node.
    #[serde(default)]
    pub needs: Vec<String>,
    /// How fan-in partials and, with polling=ALL, shard responses are merged.
    #[serde(default)]
    pub reduce: MergeStrategy,
    /// Reducer executor receiving the shard matrix when polling=ALL and
    /// `reduce` is `reducer_exec`.
    #[serde(default)]
    pub reducer: Option<EndpointSpec>,
    /// Stateful deployments route write endpoints to the shard leader.
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub write_endpoints: Vec<String>,
    /// Endpoints this deployment binds. `None` binds everything.
    #[serde(default)]
    pub handles: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_send_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
}

impl DeploymentSpec {
    /// A single-shard, single-replica deployment listening on `endpoint`.
    pub fn new(name: impl Into<String>, endpoint: EndpointSpec) -> Self {
        Self {
            name: name.into(),
            shards: 1,
            replicas: 1,
            polling: Polling::Any,
            endpoints: vec![endpoint],
            needs: Vec::new(),
            reduce: MergeStrategy::ConcatDocs,
            reducer: None,
            stateful: false,
            write_endpoints: Vec::new(),
            handles: None,
            timeout_send_ms: None,
            retries: None,
        }
    }

    pub fn needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_write(&self, exec_endpoint: &str) -> bool {
        self.stateful && self.write_endpoints.iter().any(|e| e == exec_endpoint)
    }

    pub fn binds(&self, exec_endpoint: &str) -> bool {
        match &self.handles {
            None => true,
            Some(handles) => handles
                .iter()
                .any(|h| h == exec_endpoint || h == crate::request::DEFAULT_ENDPOINT),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDescription {
    pub deployments: Vec<DeploymentSpec>,
    /// Deployments whose output reaches the client. Defaults to every sink;
    /// sinks left out are floating.
    #[serde(default)]
    pub exit_needs: Option<Vec<String>>,
    /// Merge applied at the exit join.
    #[serde(default)]
    pub exit_reduce: MergeStrategy,
}

impl FlowDescription {
    pub fn new(deployments: Vec<DeploymentSpec>) -> Self {
        Self {
            deployments,
            exit_needs: None,
            exit_reduce: MergeStrategy::ConcatDocs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json() {
        let flow: FlowDescription = serde_json::from_str(
            r#"{
                "deployments": [
                    {"name": "encoder", "endpoints": [{"host": "127.0.0.1", "port": 5001}]},
                    {"name": "indexer", "needs": ["encoder"], "polling": "ALL", "shards": 2,
                     "reduce": "first_non_empty",
                     "endpoints": [
                        {"host": "10.0.0.1", "port": 6000, "shard_id": 0},
                        {"host": "10.0.0.2", "port": 6000, "shard_id": 1, "protocol": "grpcs"}
                     ]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(flow.deployments.len(), 2);
        let indexer = &flow.deployments[1];
        assert_eq!(indexer.polling, Polling::All);
        assert_eq!(indexer.reduce, MergeStrategy::FirstNonEmpty);
        assert_eq!(indexer.replicas, 1);
        assert_eq!(indexer.endpoints[1].uri(), "https://10.0.0.2:6000");
        assert_eq!(flow.exit_reduce, MergeStrategy::ConcatDocs);
    }

    #[test]
    fn endpoint_binding() {
        let mut dep = DeploymentSpec::new("a", EndpointSpec::new("h", 1));
        assert!(dep.binds("/search"));
        dep.handles = Some(vec!["/index".into()]);
        assert!(!dep.binds("/search"));
        dep.handles = Some(vec!["/default".into()]);
        assert!(dep.binds("/search"));
    }
}
