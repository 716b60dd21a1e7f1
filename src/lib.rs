// flowgate routes data requests through a Flow: a DAG of executor
// deployments, each backed by shards x replicas of gRPC endpoints. Clients
// stream requests in over gRPC, HTTP or WebSocket; every client stream gets
// exactly one driver task which owns all of its in-flight requests, so the
// hot path never takes a lock. Requests walk the DAG inside that task, hops
// fan out to executors through a shared connection pool, and fan-in joins
// are merged before the response is yielded back in completion order.
//
// The topology is immutable once built and shared read-only. The connection
// pool is mutated only by its own maintenance task, which publishes snapshots
// that dispatchers read without coordination. Request bodies are kept in
// their encoded form as long as nobody mutates them, so hops that merely
// forward a request never pay for a decode/encode round-trip.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod lifecycle;
pub mod metrics;
pub mod net;
pub mod params;
pub mod proto;
pub mod reduce;
pub mod request;
pub mod server;
pub mod streamer;
pub mod topology;
mod traversal;

pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError};
pub use flow::{DeploymentSpec, EndpointSpec, FlowDescription, MergeStrategy, Polling};
pub use gateway::Gateway;
pub use request::DataRequest;
pub use topology::Topology;
