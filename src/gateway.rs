use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{Dispatcher, LeaderResolver};
use crate::error::{GatewayError, Result};
use crate::flow::FlowDescription;
use crate::lifecycle::Lifecycle;
use crate::metrics::GatewayMetrics;
use crate::net::ConnectionPool;
use crate::reduce::Reducers;
use crate::server::health::Health;
use crate::server::{bind, grpc, http, websocket};
use crate::streamer::Streamer;
use crate::topology::Topology;

/// Hooks a gateway can be built with.
#[derive(Default)]
pub struct GatewayOptions {
    /// Merge overrides per join.
    pub reducers: Reducers,
    /// Leader lookup for write endpoints of stateful deployments.
    pub leader: Option<Arc<dyn LeaderResolver>>,
}

/// A compiled Flow with its connection pool and streamer, not serving yet.
pub struct Gateway {
    config: GatewayConfig,
    topology: Arc<Topology>,
    pool: Arc<ConnectionPool>,
    streamer: Streamer,
    streams: CancellationToken,
}

impl Gateway {
    /// Compiles `flow` and starts probing its executors. Must be called from
    /// within a tokio runtime.
    pub fn new(flow: FlowDescription, config: GatewayConfig) -> Result<Self> {
        Self::with_options(flow, config, GatewayOptions::default())
    }

    pub fn with_options(flow: FlowDescription, config: GatewayConfig, options: GatewayOptions) -> Result<Self> {
        config.validate()?;
        let topology = Arc::new(Topology::build(flow)?);
        let pool = Arc::new(ConnectionPool::for_topology(&topology, &config)?);

        let mut dispatcher = Dispatcher::new(
            topology.clone(),
            pool.clone(),
            config.clone(),
            GatewayMetrics::new(),
        )
        .with_reducers(options.reducers);
        if let Some(leader) = options.leader {
            dispatcher = dispatcher.with_leader_resolver(leader);
        }

        let streams = CancellationToken::new();
        let streamer = Streamer::new(Arc::new(dispatcher), config.clone(), streams.clone());
        info!(
            deployments = topology.deployments().count(),
            joins = topology.join_nodes().count(),
            "flow compiled"
        );
        Ok(Self {
            config,
            topology,
            pool,
            streamer,
            streams,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        self.streamer.metrics()
    }

    /// Binds every configured port and starts serving. Nothing is served
    /// unless all ports could be bound.
    pub async fn start(self) -> Result<RunningGateway> {
        let host = self.config.host.clone();
        let grpc_listener = match self.config.grpc_port {
            Some(port) => Some(bind(&host, port).await?),
            None => None,
        };
        let http_listener = match self.config.http_port {
            Some(port) => Some(bind(&host, port).await?),
            None => None,
        };
        let websocket_listener = match self.config.websocket_port {
            Some(port) => Some(bind(&host, port).await?),
            None => None,
        };

        let servers = CancellationToken::new();
        let (reporter, health_service) = tonic_health::server::health_reporter();
        let health = Health::new(reporter);
        health.set_not_serving().await;

        let mut tasks = JoinSet::new();
        let mut addresses = Addresses::default();
        if let Some(listener) = grpc_listener {
            addresses.grpc = listener.local_addr().ok();
            let serve = grpc::serve(listener, self.streamer.clone(), health_service, servers.clone());
            tasks.spawn(async move { ("grpc", serve.await) });
        }
        if let Some(listener) = http_listener {
            addresses.http = listener.local_addr().ok();
            let serve = http::serve(listener, http::router(self.streamer.clone()), servers.clone());
            tasks.spawn(async move { ("http", serve.await) });
        }
        if let Some(listener) = websocket_listener {
            addresses.websocket = listener.local_addr().ok();
            let router = websocket::router(self.streamer.clone(), self.streams.clone());
            let serve = websocket::serve(listener, router, servers.clone());
            tasks.spawn(async move { ("websocket", serve.await) });
        }

        let lifecycle = Lifecycle {
            health,
            streamer: self.streamer,
            pool: self.pool,
            streams: self.streams,
            servers,
            drain: self.config.drain,
        };
        lifecycle.startup().await;
        Ok(RunningGateway {
            lifecycle,
            tasks,
            addresses,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Addresses {
    grpc: Option<SocketAddr>,
    http: Option<SocketAddr>,
    websocket: Option<SocketAddr>,
}

/// A serving gateway. Dropping it without [`RunningGateway::shutdown`]
/// aborts the servers.
pub struct RunningGateway {
    lifecycle: Lifecycle,
    tasks: JoinSet<(&'static str, Result<()>)>,
    addresses: Addresses,
}

impl RunningGateway {
    pub fn grpc_address(&self) -> Option<SocketAddr> {
        self.addresses.grpc
    }

    pub fn http_address(&self) -> Option<SocketAddr> {
        self.addresses.http
    }

    pub fn websocket_address(&self) -> Option<SocketAddr> {
        self.addresses.websocket
    }

    pub fn streamer(&self) -> &Streamer {
        &self.lifecycle.streamer
    }

    /// Resolves once a server stops by itself, which is always a failure
    /// while no shutdown was requested.
    pub async fn wait(&mut self) -> Result<()> {
        match self.tasks.join_next().await {
            None => std::future::pending().await,
            Some(Ok((server, Ok(())))) => {
                if self.lifecycle.is_shutting_down() {
                    return Ok(());
                }
                Err(GatewayError::Internal(format!("{server} server stopped unexpectedly")))
            }
            Some(Ok((server, Err(e)))) => {
                error!(server, "server failed: {e}");
                Err(e)
            }
            Some(Err(e)) => Err(GatewayError::Internal(format!("server task failed: {e}"))),
        }
    }

    /// Runs the shutdown sequence and waits for the servers to stop.
    pub async fn shutdown(mut self) {
        self.lifecycle.shutdown().await;
        let stopped = tokio::time::timeout(self.lifecycle.drain, async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Ok((server, Err(e))) = joined {
                    warn!(server, "server stopped with an error: {e}");
                }
            }
        })
        .await;
        if stopped.is_err() {
            warn!("servers did not stop in time, aborting them");
            self.tasks.abort_all();
        }
        info!("gateway stopped");
    }
}
