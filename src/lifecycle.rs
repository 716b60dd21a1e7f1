//! Signals and the shutdown sequence.
//!
//! Shutdown runs in a fixed order: health goes NOT_SERVING, open streams
//! drain for at most `drain`, the servers stop, and the pool closes its
//! channels last so that draining requests can still reach executors.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::gateway::RunningGateway;
use crate::net::ConnectionPool;
use crate::server::health::Health;
use crate::streamer::Streamer;

/// Slack on top of `drain` for drivers to flush their last responses.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(self) -> i32 {
        match self {
            Signal::Interrupt => 130,
            Signal::Terminate => 143,
        }
    }
}

#[cfg(unix)]
pub async fn wait_for_signal() -> Result<Signal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok(Signal::Interrupt),
        _ = terminate.recv() => Ok(Signal::Terminate),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<Signal> {
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

/// Serves until a signal arrives or a server fails, then shuts down.
/// Returns the signal, if one ended the run.
pub async fn run_until_signal(mut running: RunningGateway) -> Result<Option<Signal>> {
    let outcome = tokio::select! {
        signal = wait_for_signal() => signal.map(Some),
        served = running.wait() => served.map(|()| None),
    };
    if let Ok(Some(signal)) = &outcome {
        info!(?signal, "signal received");
    }
    running.shutdown().await;
    outcome
}

/// Everything the shutdown sequence touches.
pub struct Lifecycle {
    pub(crate) health: Health,
    pub(crate) streamer: Streamer,
    pub(crate) pool: Arc<ConnectionPool>,
    /// Cancels every client stream.
    pub(crate) streams: CancellationToken,
    /// Stops the servers.
    pub(crate) servers: CancellationToken,
    pub(crate) drain: Duration,
}

impl Lifecycle {
    pub async fn startup(&self) {
        self.health.set_serving().await;
    }

    pub async fn shutdown(&self) {
        info!(streams = self.streamer.active_streams(), "shutting down");
        self.health.set_not_serving().await;
        self.streams.cancel();
        if !self.streamer.wait_idle(self.drain + FLUSH_GRACE).await {
            warn!(
                streams = self.streamer.active_streams(),
                "streams still open after the drain period"
            );
        }
        self.servers.cancel();
        self.pool.close().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.streams.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Signal::Interrupt.exit_code(), 130);
        assert_eq!(Signal::Terminate.exit_code(), 143);
    }
}
