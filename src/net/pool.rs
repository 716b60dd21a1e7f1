use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::error::TransportError;
use super::probe::probe;
use super::replica::{backoff, channel, ConnState, Lease, Replica, ReplicaStatus};
use crate::config::GatewayConfig;
use crate::flow::EndpointSpec;
use crate::topology::Topology;

/// Replica states as last published by the maintenance task.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    entries: HashMap<String, ReplicaStatus>,
}

impl PoolSnapshot {
    pub fn state(&self, address: &str) -> ConnState {
        self.entries
            .get(address)
            .map_or(ConnState::Shutdown, |entry| entry.state)
    }

    pub fn get(&self, address: &str) -> Option<&ReplicaStatus> {
        self.entries.get(address)
    }

    pub fn is_ready(&self, address: &str) -> bool {
        self.state(address) == ConnState::Ready
    }
}

#[derive(Debug)]
enum Report {
    Failure { address: String, reason: String },
}

/// Channels to every executor replica of a Flow, keyed by `host:port`.
///
/// Replica states are owned by a single maintenance task, which probes the
/// replicas and publishes every change as a new [`PoolSnapshot`]. Callers
/// only read snapshots and bump the per-replica outstanding counters.
pub struct ConnectionPool {
    replicas: HashMap<String, Arc<Replica>>,
    snapshot: watch::Receiver<Arc<PoolSnapshot>>,
    reports: mpsc::UnboundedSender<Report>,
    max_outstanding: usize,
    cancel: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates channels for `endpoints` and starts probing them. Must be
    /// called from within a tokio runtime.
    pub fn start(
        endpoints: impl IntoIterator<Item = EndpointSpec>,
        config: &GatewayConfig,
    ) -> Result<Self, TransportError> {
        let mut replicas = HashMap::new();
        let mut entries = HashMap::new();
        for endpoint in endpoints {
            let address = endpoint.address();
            if replicas.contains_key(&address) {
                continue;
            }
            entries.insert(
                address.clone(),
                ReplicaStatus {
                    state: ConnState::Connecting,
                    channel: channel(&endpoint, config)?,
                    last_probe: None,
                    consecutive_failures: 0,
                    backoff_until: None,
                },
            );
            replicas.insert(address, Arc::new(Replica::new(endpoint)));
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(PoolSnapshot {
            entries: entries.clone(),
        }));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let maintenance = Maintenance {
            replicas: replicas.clone(),
            entries,
            snapshot: snapshot_tx,
            config: config.clone(),
        };
        let handle = tokio::spawn(maintenance.run(reports_rx, cancel.clone()));

        Ok(Self {
            replicas,
            snapshot: snapshot_rx,
            reports: reports_tx,
            max_outstanding: config.max_outstanding_per_replica,
            cancel,
            maintenance: Mutex::new(Some(handle)),
        })
    }

    /// Pool over every executor and reducer endpoint of `topology`.
    pub fn for_topology(topology: &Topology, config: &GatewayConfig) -> Result<Self, TransportError> {
        let endpoints = topology.deployments().flat_map(|(_, dep)| {
            dep.shards
                .iter()
                .flatten()
                .chain(dep.spec.reducer.iter())
                .cloned()
                .collect::<Vec<_>>()
        });
        Self::start(endpoints, config)
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PoolSnapshot>> {
        self.snapshot.clone()
    }

    pub fn outstanding(&self, address: &str) -> usize {
        self.replicas.get(address).map_or(0, |r| r.outstanding())
    }

    /// A ready channel to `address` with one call slot reserved.
    pub fn acquire(&self, address: &str) -> Result<Lease, TransportError> {
        let replica = self
            .replicas
            .get(address)
            .ok_or_else(|| TransportError::NotReady(address.to_string()))?;
        let snapshot = self.snapshot();
        let Some(status) = snapshot.get(address) else {
            return Err(TransportError::NotReady(address.to_string()));
        };
        match status.state {
            ConnState::Ready => {
                Lease::try_new(replica.clone(), status.channel.clone(), self.max_outstanding)
            }
            ConnState::Shutdown => Err(TransportError::Closed),
            ConnState::Connecting | ConnState::TransientFailure => {
                Err(TransportError::NotReady(address.to_string()))
            }
        }
    }

    /// Marks `address` as failing until a probe says otherwise.
    pub fn report_failure(&self, address: &str, error: &TransportError) {
        let report = Report::Failure {
            address: address.to_string(),
            reason: error.to_string(),
        };
        if self.reports.send(report).is_err() {
            debug!(address, "failure report dropped, pool is closed");
        }
    }

    /// Stops probing and marks every replica SHUTDOWN.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.maintenance.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("connection pool maintenance task failed: {e}");
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Maintenance {
    replicas: HashMap<String, Arc<Replica>>,
    entries: HashMap<String, ReplicaStatus>,
    snapshot: watch::Sender<Arc<PoolSnapshot>>,
    config: GatewayConfig,
}

impl Maintenance {
    async fn run(mut self, mut reports: mpsc::UnboundedReceiver<Report>, cancel: CancellationToken) {
        let span = debug_span!("pool");
        async move {
            debug!(replicas = self.entries.len(), "connection pool started");
            let mut interval = tokio::time::interval(self.config.probe_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let next_retry = self.next_retry();
                select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Instant::now();
                        self.probe(|entry| entry.backoff_until.map_or(true, |at| at <= now)).await;
                    }
                    _ = sleep_until(next_retry), if next_retry.is_some() => {
                        let now = Instant::now();
                        self.probe(|entry| {
                            entry.state == ConnState::TransientFailure
                                && entry.backoff_until.map_or(true, |at| at <= now)
                        })
                        .await;
                    }
                    Some(report) = reports.recv() => match report {
                        Report::Failure { address, reason } => {
                            if self.mark_failed(&address, &reason) {
                                self.publish();
                            }
                        }
                    },
                }
            }

            for entry in self.entries.values_mut() {
                entry.state = ConnState::Shutdown;
            }
            self.publish();
            debug!("connection pool closed");
        }
        .instrument(span)
        .await
    }

    fn next_retry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.state == ConnState::TransientFailure)
            .filter_map(|e| e.backoff_until)
            .min()
    }

    async fn probe(&mut self, due: impl Fn(&ReplicaStatus) -> bool) {
        let mut targets = Vec::new();
        for (address, entry) in self.entries.iter_mut() {
            if entry.state == ConnState::Shutdown || !due(entry) {
                continue;
            }
            if entry.state == ConnState::TransientFailure {
                // reconnect from scratch rather than trusting the old channel
                if let Some(replica) = self.replicas.get(address) {
                    match channel(&replica.endpoint, &self.config) {
                        Ok(fresh) => entry.channel = fresh,
                        Err(e) => warn!(address, "could not rebuild channel: {e}"),
                    }
                }
            }
            targets.push((address.clone(), entry.channel.clone()));
        }
        if targets.is_empty() {
            return;
        }

        let timeout = self.config.probe_timeout;
        let results = join_all(targets.into_iter().map(|(address, channel)| async move {
            let result = probe(&address, channel, timeout).await;
            (address, result)
        }))
        .await;

        let now = Instant::now();
        let mut changed = false;
        for (address, result) in results {
            let Some(entry) = self.entries.get_mut(&address) else {
                continue;
            };
            entry.last_probe = Some(now);
            match result {
                Ok(()) => {
                    if entry.state != ConnState::Ready {
                        info!(address, "replica is ready");
                        changed = true;
                    }
                    entry.state = ConnState::Ready;
                    entry.consecutive_failures = 0;
                    entry.backoff_until = None;
                }
                Err(e) => {
                    if entry.state != ConnState::TransientFailure {
                        warn!(address, "replica failed its health check: {e}");
                        changed = true;
                    } else {
                        debug!(address, failures = entry.consecutive_failures, "replica still failing: {e}");
                    }
                    self.fail(&address, now);
                }
            }
        }
        if changed {
            self.publish();
        }
    }

    fn mark_failed(&mut self, address: &str, reason: &str) -> bool {
        match self.entries.get(address).map(|e| e.state) {
            Some(ConnState::Ready) | Some(ConnState::Connecting) => {
                warn!(address, "replica reported failing: {reason}");
                self.fail(address, Instant::now());
                true
            }
            _ => false,
        }
    }

    fn fail(&mut self, address: &str, now: Instant) {
        let Some(entry) = self.entries.get_mut(address) else {
            return;
        };
        entry.state = ConnState::TransientFailure;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.backoff_until = Some(
            now + backoff(
                self.config.backoff_initial,
                self.config.backoff_cap,
                entry.consecutive_failures,
            ),
        );
    }

    fn publish(&self) {
        self.snapshot.send_replace(Arc::new(PoolSnapshot {
            entries: self.entries.clone(),
        }));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Waits up to `timeout` for the next published snapshot.
pub async fn wait_for_change(
    rx: &mut watch::Receiver<Arc<PoolSnapshot>>,
    timeout: Duration,
) -> bool {
    matches!(tokio::time::timeout(timeout, rx.changed()).await, Ok(Ok(())))
}
