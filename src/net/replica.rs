use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};

use super::error::TransportError;
use crate::config::GatewayConfig;
use crate::flow::EndpointSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// What the maintenance task knows about one replica. Cloned into every
/// published snapshot.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub state: ConnState,
    pub channel: Channel,
    pub last_probe: Option<Instant>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
}

/// The part of a replica that lives outside snapshots: its address and the
/// outstanding call counter every dispatcher updates.
#[derive(Debug)]
pub struct Replica {
    pub endpoint: EndpointSpec,
    outstanding: AtomicUsize,
}

impl Replica {
    pub fn new(endpoint: EndpointSpec) -> Self {
        Self {
            endpoint,
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> String {
        self.endpoint.address()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Reserves one call slot, unless `cap` calls are already outstanding.
    fn reserve(&self, cap: usize) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .is_ok()
    }
}

/// A channel handed out for one call. Dropping it releases the call slot;
/// the channel itself is multiplexed and never returned to the pool.
#[derive(Debug)]
pub struct Lease {
    pub channel: Channel,
    replica: Arc<Replica>,
}

impl Lease {
    pub(super) fn try_new(
        replica: Arc<Replica>,
        channel: Channel,
        cap: usize,
    ) -> Result<Self, TransportError> {
        if !replica.reserve(cap) {
            return Err(TransportError::Overloaded(replica.address()));
        }
        Ok(Self { channel, replica })
    }

    pub fn address(&self) -> String {
        self.replica.address()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.replica.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazily connecting channel with the keepalive and size settings every
/// executor connection uses.
pub fn channel(endpoint: &EndpointSpec, config: &GatewayConfig) -> Result<Channel, TransportError> {
    let uri = endpoint.uri();
    let builder = Endpoint::from_shared(uri.clone())
        .map_err(|e| TransportError::InvalidUri {
            uri,
            reason: e.to_string(),
        })?
        .http2_keep_alive_interval(Duration::from_secs(10))
        .keep_alive_timeout(Duration::from_secs(5))
        .keep_alive_while_idle(true)
        .connect_timeout(config.send_timeout)
        .tcp_nodelay(true);
    Ok(builder.connect_lazy())
}

/// Delay before reconnecting after `failures` consecutive failures:
/// doubling from `initial` up to `cap`, then jittered by up to 20% either way.
pub fn backoff(initial: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = initial.saturating_mul(1u32 << exp).min(cap);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter)
}
