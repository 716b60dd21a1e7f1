use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use flowgate::config::{GrpcCompression, ENV_LOG_LEVEL};
use flowgate::lifecycle::run_until_signal;
use flowgate::{FlowDescription, Gateway, GatewayConfig, GatewayError};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Serves a Flow of executor deployments over gRPC, HTTP and WebSocket.
#[derive(Debug, Parser)]
#[command(name = "flowgate", version)]
struct Args {
    /// JSON file describing the Flow.
    #[arg(long, env = "GATEWAY_FLOW")]
    flow: PathBuf,

    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    host: String,
    #[arg(long, env = "GATEWAY_GRPC_PORT")]
    grpc_port: Option<u16>,
    #[arg(long, env = "GATEWAY_HTTP_PORT")]
    http_port: Option<u16>,
    #[arg(long, env = "GATEWAY_WEBSOCKET_PORT")]
    websocket_port: Option<u16>,

    /// Max in-flight requests per client stream, 0 for unbounded.
    #[arg(long, env = "GATEWAY_PREFETCH", default_value_t = 0)]
    prefetch: usize,
    #[arg(long, env = "GATEWAY_MAX_STREAMS", default_value_t = 1024)]
    max_streams: usize,
    #[arg(long, env = "GATEWAY_MAX_OUTSTANDING", default_value_t = 100)]
    max_outstanding_per_replica: usize,
    #[arg(long, env = "GATEWAY_SEND_TIMEOUT_MS", default_value_t = 10_000)]
    send_timeout_ms: u64,
    #[arg(long, env = "GATEWAY_MAX_RETRIES", default_value_t = 2)]
    max_retries: usize,
    #[arg(long, env = "GATEWAY_DRAIN_MS", default_value_t = 5_000)]
    drain_ms: u64,
    /// gzip or zstd on calls towards executors.
    #[arg(long, env = "GATEWAY_COMPRESSION")]
    compression: Option<GrpcCompression>,
}

impl Args {
    fn config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::builder()
            .host(self.host.clone())
            .prefetch(self.prefetch)
            .max_streams(self.max_streams)
            .max_outstanding_per_replica(self.max_outstanding_per_replica)
            .send_timeout(Duration::from_millis(self.send_timeout_ms))
            .max_retries(self.max_retries)
            .drain(Duration::from_millis(self.drain_ms))
            .build()
            .with_env();
        config.grpc_port = self.grpc_port;
        config.http_port = self.http_port;
        config.websocket_port = self.websocket_port;
        config.compression = self.compression;
        config
    }
}

fn load_flow(path: &Path) -> Result<FlowDescription, GatewayError> {
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw).map_err(|e| {
        GatewayError::InvalidTopology(format!("{} does not parse: {e}", path.display()))
    })
}

/// 2 when a port could not be bound, 1 for a bad Flow or any other failure.
fn exit_code(error: &GatewayError) -> ExitCode {
    match error {
        GatewayError::Bind { .. } => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

async fn run(args: Args) -> Result<Option<i32>, GatewayError> {
    let flow = load_flow(&args.flow)?;
    let gateway = Gateway::new(flow, args.config())?;
    let running = gateway.start().await?;
    let signal = run_until_signal(running).await?;
    Ok(signal.map(|signal| signal.exit_code()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "error".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(level.to_ascii_lowercase()).unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .init();

    match run(args).await {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(code)) => ExitCode::from(code as u8),
        Err(e) => {
            error!("{e}");
            exit_code(&e)
        }
    }
}
