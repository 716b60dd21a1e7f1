//! Generated protobuf messages and gRPC service glue for `proto/jina.proto`.
//!
//! `DataRequestProto` and `DataRequestListProto` are not generated: they map
//! onto [`crate::request::DataRequest`] and [`crate::request::DataRequestList`]
//! and travel through [`crate::request::codec::LazyCodec`].

#[allow(missing_docs, clippy::all)]
mod jina {
    tonic::include_proto!("jina");
}

pub use jina::status_proto::{ExceptionProto, StatusCode};
pub use jina::{DocumentProto, HeaderProto, RouteProto, StatusProto};

pub use jina::jina_data_request_rpc_client::JinaDataRequestRpcClient;
pub use jina::jina_data_request_rpc_server::{JinaDataRequestRpc, JinaDataRequestRpcServer};
pub use jina::jina_rpc_client::JinaRpcClient;
pub use jina::jina_rpc_server::{JinaRpc, JinaRpcServer};
pub use jina::jina_single_data_request_rpc_client::JinaSingleDataRequestRpcClient;
pub use jina::jina_single_data_request_rpc_server::{
    JinaSingleDataRequestRpc, JinaSingleDataRequestRpcServer,
};

/// Version of the wire schema, reported by `GET /status`.
pub const SCHEMA_VERSION: &str = "1";

impl StatusProto {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self::with_code(StatusCode::Error, description)
    }

    pub fn error_chained(description: impl Into<String>) -> Self {
        Self::with_code(StatusCode::ErrorChained, description)
    }

    pub fn with_code(code: StatusCode, description: impl Into<String>) -> Self {
        let mut status = Self {
            description: description.into(),
            ..Default::default()
        };
        status.set_code(code);
        status
    }

    /// True for `ERROR` and `ERROR_CHAINED`: a request carrying such a status
    /// is not dispatched to any further executor.
    pub fn is_error(&self) -> bool {
        matches!(self.code(), StatusCode::Error | StatusCode::ErrorChained)
    }
}
