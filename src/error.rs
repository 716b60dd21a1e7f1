use axum::http::StatusCode as HttpStatus;
use thiserror::Error;

use crate::net::error::TransportError;
use crate::proto::{ExceptionProto, StatusProto};

/// Coarse classification of every failure the gateway can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTopology,
    BadRequest,
    NoAvailableReplica,
    Timeout,
    ExecutorError,
    ResourceExhausted,
    Cancelled,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTopology => "INVALID_TOPOLOGY",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::NoAvailableReplica => "NO_AVAILABLE_REPLICA",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ExecutorError => "EXECUTOR_ERROR",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Gateway error taxonomy.
///
/// Per-branch executor failures normally ride inside a request's
/// `StatusProto` and never become a `GatewayError`; this type covers what
/// has to leave the gateway as a transport status, an HTTP code, or a
/// rejected topology.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The Flow description does not compile into a DAG.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Malformed payload, undecodable bytes, bad `target_executor` regex.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no available replica for deployment {deployment} shard {shard}")]
    NoAvailableReplica { deployment: String, shard: usize },

    /// Request deadline exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// An executor answered with an `ERROR` status.
    #[error("executor {executor} failed: {description}")]
    Executor {
        executor: String,
        description: String,
    },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("could not decode request: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A listening port could not be bound.
    #[error("could not bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A bug in the gateway. The message is logged in full and redacted
    /// towards clients.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidTopology(_) => ErrorKind::InvalidTopology,
            GatewayError::BadRequest(_) | GatewayError::Decode(_) => ErrorKind::BadRequest,
            GatewayError::NoAvailableReplica { .. } => ErrorKind::NoAvailableReplica,
            GatewayError::Timeout(_) => ErrorKind::Timeout,
            GatewayError::Executor { .. } => ErrorKind::ExecutorError,
            GatewayError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            GatewayError::Cancelled(_) => ErrorKind::Cancelled,
            GatewayError::Transport(err) => err.kind(),
            GatewayError::Io(_) | GatewayError::Bind { .. } | GatewayError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The message shown to clients. Internal failures are redacted.
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal gateway error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn to_status(&self) -> tonic::Status {
        let message = self.client_message();
        match self.kind() {
            ErrorKind::InvalidTopology => tonic::Status::failed_precondition(message),
            ErrorKind::BadRequest => tonic::Status::invalid_argument(message),
            ErrorKind::NoAvailableReplica | ErrorKind::Unavailable => {
                tonic::Status::unavailable(message)
            }
            ErrorKind::Timeout => tonic::Status::deadline_exceeded(message),
            ErrorKind::ExecutorError => tonic::Status::unknown(message),
            ErrorKind::ResourceExhausted => tonic::Status::resource_exhausted(message),
            ErrorKind::Cancelled => tonic::Status::cancelled(message),
            ErrorKind::Internal => tonic::Status::internal(message),
        }
    }

    pub fn http_status(&self) -> HttpStatus {
        match self.kind() {
            ErrorKind::BadRequest => HttpStatus::BAD_REQUEST,
            ErrorKind::NoAvailableReplica | ErrorKind::Unavailable => {
                HttpStatus::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout => HttpStatus::GATEWAY_TIMEOUT,
            ErrorKind::ResourceExhausted => HttpStatus::TOO_MANY_REQUESTS,
            ErrorKind::ExecutorError => HttpStatus::BAD_GATEWAY,
            ErrorKind::Cancelled => HttpStatus::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidTopology | ErrorKind::Internal => {
                HttpStatus::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// `ERROR` status carrying this error, for embedding in a response.
    pub fn to_status_proto(&self) -> StatusProto {
        let mut status = StatusProto::error(self.client_message());
        status.exception = Some(ExceptionProto {
            name: self.kind().as_str().to_string(),
            args: vec![self.client_message()],
            ..Default::default()
        });
        status
    }
}
