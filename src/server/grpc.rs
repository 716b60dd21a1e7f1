use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tonic_health::pb::health_server::{Health as HealthService, HealthServer};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::proto::{JinaRpc, JinaRpcServer, JinaSingleDataRequestRpc, JinaSingleDataRequestRpcServer};
use crate::request::DataRequest;
use crate::streamer::Streamer;

type ResponseStream = Pin<Box<dyn Stream<Item = std::result::Result<DataRequest, Status>> + Send>>;

/// `jina.JinaRPC` and `jina.JinaSingleDataRequestRPC` over the streamer.
#[derive(Clone)]
pub struct GrpcGateway {
    streamer: Streamer,
}

impl GrpcGateway {
    pub fn new(streamer: Streamer) -> Self {
        Self { streamer }
    }
}

#[tonic::async_trait]
impl JinaRpc for GrpcGateway {
    type CallStream = ResponseStream;

    async fn call(
        &self,
        request: Request<Streaming<DataRequest>>,
    ) -> std::result::Result<Response<Self::CallStream>, Status> {
        let ingress = request.into_inner().map(|item| {
            item.map_err(|status| {
                debug!("client stream broke: {}", status.message());
                GatewayError::Cancelled(format!("client stream failed: {}", status.message()))
            })
        });
        let responses = self.streamer.open(ingress).map_err(|e| e.to_status())?;
        Ok(Response::new(Box::pin(responses.map(Ok))))
    }
}

#[tonic::async_trait]
impl JinaSingleDataRequestRpc for GrpcGateway {
    async fn process_single_data(
        &self,
        request: Request<DataRequest>,
    ) -> std::result::Result<Response<DataRequest>, Status> {
        self.streamer
            .unary(request.into_inner())
            .await
            .map(Response::new)
            .map_err(|e| e.to_status())
    }
}

/// Serves the gateway services and `health` on `listener` until `shutdown`.
pub async fn serve<H>(
    listener: TcpListener,
    streamer: Streamer,
    health: HealthServer<H>,
    shutdown: CancellationToken,
) -> Result<()>
where
    H: HealthService,
{
    let compression = streamer.config().compression;
    let gateway = GrpcGateway::new(streamer);

    let mut call = JinaRpcServer::new(gateway.clone())
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Zstd);
    let mut single = JinaSingleDataRequestRpcServer::new(gateway)
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Zstd);
    if let Some(compression) = compression {
        call = call.send_compressed(compression.encoding());
        single = single.send_compressed(compression.encoding());
    }

    if let Ok(address) = listener.local_addr() {
        info!(%address, "gRPC gateway listening");
    }
    Server::builder()
        .tcp_nodelay(true)
        .http2_keepalive_interval(Some(Duration::from_secs(10)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .add_service(health)
        .add_service(call)
        .add_service(single)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("gRPC server failed: {e}")))
}
