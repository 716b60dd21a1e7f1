//! In-process fake executors and gateway helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flowgate::params::{json_to_value, RESULTS_KEY};
use flowgate::proto::{
    DocumentProto, JinaDataRequestRpc, JinaDataRequestRpcServer, JinaSingleDataRequestRpc,
    JinaSingleDataRequestRpcServer, StatusProto,
};
use flowgate::gateway::GatewayOptions;
use flowgate::request::{DataRequest, DataRequestBody, DataRequestList, Document};
use flowgate::{EndpointSpec, FlowDescription, Gateway, GatewayConfig};
use prost::Message;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

/// What a fake executor does with each request.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Echo,
    /// Rewrites every document's text to `"{name}({text})"`.
    Tag,
    Sleep(Duration),
    /// Answers with an `ERROR` status carrying this description.
    Fail(&'static str),
    /// Returns `parameters.__results__` set to this JSON value.
    Results(serde_json::Value),
    /// Fails the call with gRPC `UNAVAILABLE` and this message.
    Unavailable(&'static str),
}

#[derive(Default)]
pub struct Stats {
    received: Mutex<Vec<DataRequestBody>>,
    lists: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[derive(Clone)]
struct FakeService {
    name: String,
    behaviour: Behaviour,
    stats: Arc<Stats>,
}

fn internal(e: impl std::fmt::Display) -> Status {
    Status::internal(e.to_string())
}

impl FakeService {
    async fn handle(&self, request: DataRequest) -> Result<DataRequest, Status> {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        let result = self.respond(request).await;
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn respond(&self, mut request: DataRequest) -> Result<DataRequest, Status> {
        let body = request.body().map_err(internal)?.clone();
        self.stats.received.lock().unwrap().push(body);
        match &self.behaviour {
            Behaviour::Echo => {}
            Behaviour::Tag => {
                for doc in &mut request.body_mut().map_err(internal)?.data {
                    doc.text = format!("{}({})", self.name, doc.text);
                }
            }
            Behaviour::Sleep(pause) => tokio::time::sleep(*pause).await,
            Behaviour::Fail(description) => {
                request.body_mut().map_err(internal)?.status = Some(StatusProto::error(*description));
            }
            Behaviour::Results(value) => {
                request
                    .body_mut()
                    .map_err(internal)?
                    .parameters_mut()
                    .fields
                    .insert(RESULTS_KEY.to_string(), json_to_value(value));
            }
            Behaviour::Unavailable(message) => return Err(Status::unavailable(*message)),
        }
        Ok(request)
    }
}

#[tonic::async_trait]
impl JinaSingleDataRequestRpc for FakeService {
    async fn process_single_data(
        &self,
        request: Request<DataRequest>,
    ) -> Result<Response<DataRequest>, Status> {
        self.handle(request.into_inner()).await.map(Response::new)
    }
}

#[tonic::async_trait]
impl JinaDataRequestRpc for FakeService {
    /// Concatenates the documents of every request into the first one.
    async fn process_data(
        &self,
        request: Request<DataRequestList>,
    ) -> Result<Response<DataRequest>, Status> {
        self.stats.lists.fetch_add(1, Ordering::SeqCst);
        let mut requests = request.into_inner().requests.into_iter();
        let Some(mut merged) = requests.next() else {
            return Err(Status::invalid_argument("empty request list"));
        };
        let mut docs = Vec::new();
        for other in requests {
            docs.extend(other.body().map_err(internal)?.data.iter().cloned());
        }
        let body = merged.body_mut().map_err(internal)?;
        body.data.extend(docs);
        for doc in &mut body.data {
            doc.text = format!("{}({})", self.name, doc.text);
        }
        Ok(Response::new(merged))
    }
}

/// A tonic server on an ephemeral port speaking the executor services and
/// `grpc.health.v1`. Stops when dropped.
pub struct FakeExecutor {
    pub name: String,
    pub port: u16,
    stats: Arc<Stats>,
    stop: CancellationToken,
}

impl FakeExecutor {
    pub async fn spawn(name: &str, behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());
        let service = FakeService {
            name: name.to_string(),
            behaviour,
            stats: stats.clone(),
        };
        let (_, health) = tonic_health::server::health_reporter();
        let stop = CancellationToken::new();
        let token = stop.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(health)
                .add_service(JinaSingleDataRequestRpcServer::new(service.clone()))
                .add_service(JinaDataRequestRpcServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    token.cancelled().await
                })
                .await
                .unwrap();
        });
        Self {
            name: name.to_string(),
            port,
            stats,
            stop,
        }
    }

    pub fn endpoint(&self) -> EndpointSpec {
        EndpointSpec::new("127.0.0.1", self.port)
    }

    pub fn calls(&self) -> usize {
        self.stats.received.lock().unwrap().len()
    }

    pub fn list_calls(&self) -> usize {
        self.stats.lists.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.stats.max_active.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<DataRequestBody> {
        self.stats.received.lock().unwrap().clone()
    }
}

impl Drop for FakeExecutor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// An endpoint nobody listens on.
pub async fn down_endpoint() -> EndpointSpec {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    EndpointSpec::new("127.0.0.1", port)
}

/// Fast probing and short waits, gRPC on an ephemeral port.
pub fn test_config() -> GatewayConfig {
    GatewayConfig::builder()
        .host("127.0.0.1")
        .grpc_port(0)
        .probe_interval(Duration::from_millis(50))
        .probe_timeout(Duration::from_millis(500))
        .backoff_initial(Duration::from_millis(50))
        .backoff_cap(Duration::from_millis(200))
        .replica_wait(Duration::from_millis(200))
        .drain(Duration::from_millis(500))
        .build()
}

/// Builds a gateway and waits until every endpoint in `up` is READY.
pub async fn ready_gateway(flow: FlowDescription, config: GatewayConfig, up: &[EndpointSpec]) -> Gateway {
    ready_gateway_with(flow, config, GatewayOptions::default(), up).await
}

pub async fn ready_gateway_with(
    flow: FlowDescription,
    config: GatewayConfig,
    options: GatewayOptions,
    up: &[EndpointSpec],
) -> Gateway {
    let gateway = Gateway::with_options(flow, config, options).unwrap();
    let mut changes = gateway.pool().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = gateway.pool().snapshot();
            if up.iter().all(|endpoint| snapshot.is_ready(&endpoint.address())) {
                return;
            }
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("executors never became ready");
    gateway
}

pub fn doc(id: &str) -> Document {
    DocumentProto {
        id: id.to_string(),
        text: id.to_string(),
        ..Default::default()
    }
    .into()
}

/// A document carrying field 9, which `DocumentProto` does not declare.
pub fn doc_with_embedding(id: &str) -> Document {
    let mut raw = DocumentProto {
        id: id.to_string(),
        text: id.to_string(),
        ..Default::default()
    }
    .encode_to_vec();
    raw.extend_from_slice(&EMBEDDING_FIELD);
    Document::decode(raw.as_slice()).unwrap()
}

/// Field 9, length 2, bytes `HM`.
pub const EMBEDDING_FIELD: [u8; 4] = [74, 2, 72, 77];

pub fn request(id: &str, endpoint: &str, docs: &[&str]) -> DataRequest {
    let mut body = DataRequestBody {
        exec_endpoint: endpoint.to_string(),
        data: docs.iter().map(|d| doc(d)).collect(),
        ..Default::default()
    };
    body.set_request_id(id);
    DataRequest::from_body(body)
}

/// Executor names of `response`'s routes, in order.
pub fn route_names(response: &DataRequest) -> Vec<String> {
    response
        .body()
        .unwrap()
        .routes
        .iter()
        .map(|r| r.executor.clone())
        .collect()
}

pub fn doc_texts(response: &DataRequest) -> Vec<String> {
    response
        .body()
        .unwrap()
        .data
        .iter()
        .map(|d| d.text.clone())
        .collect()
}
