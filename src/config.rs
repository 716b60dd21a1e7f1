use std::time::Duration;

use tonic::codec::CompressionEncoding;
use typed_builder::TypedBuilder;

use crate::error::{GatewayError, Result};

pub const ENV_LOG_LEVEL: &str = "GATEWAY_LOG_LEVEL";
pub const ENV_DISABLE_HEALTH_LOGS: &str = "GATEWAY_DISABLE_HEALTH_LOGS";
pub const ENV_WORKSPACE_BASE: &str = "GATEWAY_DEFAULT_WORKSPACE_BASE";

/// Transport compression used on gRPC calls the gateway sends. The sender
/// chooses; servers accept every supported encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCompression {
    Gzip,
    Zstd,
}

impl GrpcCompression {
    pub fn encoding(self) -> CompressionEncoding {
        match self {
            GrpcCompression::Gzip => CompressionEncoding::Gzip,
            GrpcCompression::Zstd => CompressionEncoding::Zstd,
        }
    }
}

impl std::str::FromStr for GrpcCompression {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" => Ok(GrpcCompression::Gzip),
            "zstd" => Ok(GrpcCompression::Zstd),
            other => Err(GatewayError::BadRequest(format!(
                "unsupported compression `{other}`"
            ))),
        }
    }
}

/// Runtime settings of one gateway process.
///
/// Every field has the default the gateway ships with; only the listening
/// ports are commonly set. Protocols whose port is `None` are not served.
#[derive(Debug, Clone, TypedBuilder)]
pub struct GatewayConfig {
    #[builder(default = "0.0.0.0".to_string(), setter(into))]
    pub host: String,
    #[builder(default, setter(strip_option))]
    pub grpc_port: Option<u16>,
    #[builder(default, setter(strip_option))]
    pub http_port: Option<u16>,
    #[builder(default, setter(strip_option))]
    pub websocket_port: Option<u16>,

    /// Max in-flight requests per client stream, 0 means unbounded.
    #[builder(default = 0)]
    pub prefetch: usize,
    #[builder(default = 1000)]
    pub max_prefetch: usize,
    #[builder(default = 1024)]
    pub max_streams: usize,
    #[builder(default = 100)]
    pub max_outstanding_per_replica: usize,

    /// How long a cancelled stream waits for in-flight requests to settle.
    #[builder(default = Duration::from_millis(5_000))]
    pub drain: Duration,
    /// Per-call deadline on executor RPCs.
    #[builder(default = Duration::from_millis(10_000))]
    pub send_timeout: Duration,
    #[builder(default = 2)]
    pub max_retries: usize,
    /// How long the dispatcher waits for a probe to promote a replica.
    #[builder(default = Duration::from_millis(500))]
    pub replica_wait: Duration,

    #[builder(default = Duration::from_secs(2))]
    pub probe_interval: Duration,
    #[builder(default = Duration::from_millis(100))]
    pub probe_timeout: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub backoff_initial: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub backoff_cap: Duration,

    #[builder(default, setter(strip_option))]
    pub compression: Option<GrpcCompression>,

    #[builder(default = "error".to_string(), setter(into))]
    pub log_level: String,
    #[builder(default = false)]
    pub disable_health_logs: bool,
    #[builder(default, setter(strip_option, into))]
    pub workspace_base: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayConfig {
    /// Overlays the `GATEWAY_*` environment variables.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|l| !l.is_empty()) {
            self.log_level = level.to_ascii_lowercase();
        }
        if let Some(flag) = lookup(ENV_DISABLE_HEALTH_LOGS) {
            self.disable_health_logs = is_truthy(&flag);
        }
        if let Some(base) = lookup(ENV_WORKSPACE_BASE) {
            self.workspace_base = Some(base);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch > self.max_prefetch {
            return Err(GatewayError::ResourceExhausted(format!(
                "prefetch {} exceeds the cap of {}",
                self.prefetch, self.max_prefetch
            )));
        }
        if self.max_streams == 0 || self.max_outstanding_per_replica == 0 {
            return Err(GatewayError::BadRequest(
                "stream and replica caps must be positive".into(),
            ));
        }
        if self.grpc_port.is_none() && self.http_port.is_none() && self.websocket_port.is_none()
        {
            return Err(GatewayError::BadRequest(
                "at least one of the grpc, http or websocket ports must be set".into(),
            ));
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}
