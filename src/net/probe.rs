use std::time::Duration;

use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::trace;

use super::error::TransportError;

/// `grpc.health.v1.Health/Check` for the overall service, bounded by `timeout`.
pub async fn probe(address: &str, channel: Channel, timeout: Duration) -> Result<(), TransportError> {
    let mut client = HealthClient::new(channel);
    let request = HealthCheckRequest {
        service: String::new(),
    };
    let response = match tokio::time::timeout(timeout, client.check(request)).await {
        Ok(Ok(response)) => response.into_inner(),
        Ok(Err(status)) => return Err(TransportError::status(address, status)),
        Err(_) => return Err(TransportError::Timeout(address.to_string())),
    };
    match response.status() {
        ServingStatus::Serving => {
            trace!(address, "probe ok");
            Ok(())
        }
        other => Err(TransportError::NotServing {
            address: address.to_string(),
            status: other.as_str_name().to_string(),
        }),
    }
}
