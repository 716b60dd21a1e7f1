use thiserror::Error;
use tonic::Code;

use crate::error::ErrorKind;

/// Failure of one call to one replica.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The replica is not READY in the current pool snapshot.
    #[error("replica {0} is not ready")]
    NotReady(String),

    #[error("replica {0} is at its outstanding call limit")]
    Overloaded(String),

    #[error("call to {0} timed out")]
    Timeout(String),

    #[error("{address} answered {code}: {message}", code = code_name(.status.code()), message = .status.message())]
    Status {
        address: String,
        status: tonic::Status,
    },

    #[error("health check of {address} reported {status}")]
    NotServing { address: String, status: String },

    #[error("connection pool is closed")]
    Closed,
}

impl TransportError {
    pub fn status(address: impl Into<String>, status: tonic::Status) -> Self {
        TransportError::Status {
            address: address.into(),
            status,
        }
    }

    pub fn code(&self) -> Code {
        match self {
            TransportError::InvalidUri { .. } => Code::InvalidArgument,
            TransportError::NotReady(_)
            | TransportError::NotServing { .. }
            | TransportError::Closed => Code::Unavailable,
            TransportError::Overloaded(_) => Code::ResourceExhausted,
            TransportError::Timeout(_) => Code::DeadlineExceeded,
            TransportError::Status { status, .. } => status.code(),
        }
    }

    /// Whether another replica may succeed where this call failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), Code::Unavailable | Code::DeadlineExceeded)
            && !matches!(self, TransportError::Closed)
    }

    /// A stateful replica that refused a write because it is not the leader.
    pub fn not_leader(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                status.code() == Code::Unavailable && status.message().contains("not the leader")
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code() {
            Code::DeadlineExceeded => ErrorKind::Timeout,
            Code::ResourceExhausted => ErrorKind::ResourceExhausted,
            Code::Cancelled => ErrorKind::Cancelled,
            Code::InvalidArgument => ErrorKind::BadRequest,
            Code::Unavailable => ErrorKind::Unavailable,
            _ => ErrorKind::ExecutorError,
        }
    }
}

/// Upper-case gRPC name of `code`, as used in descriptions.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}
