use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::info;

/// Services reported by `grpc.health.v1.Health`; the empty name is the
/// gateway as a whole.
pub const SERVICES: [&str; 3] = ["", "jina.JinaRPC", "jina.JinaSingleDataRequestRPC"];

/// Serving status of the gateway's gRPC services.
#[derive(Clone)]
pub struct Health {
    reporter: HealthReporter,
}

impl Health {
    pub fn new(reporter: HealthReporter) -> Self {
        Self { reporter }
    }

    pub async fn set_serving(&self) {
        self.set_all(ServingStatus::Serving).await;
        info!("health: SERVING");
    }

    pub async fn set_not_serving(&self) {
        self.set_all(ServingStatus::NotServing).await;
        info!("health: NOT_SERVING");
    }

    async fn set_all(&self, status: ServingStatus) {
        let mut reporter = self.reporter.clone();
        for service in SERVICES {
            reporter.set_service_status(service, status).await;
        }
    }
}
