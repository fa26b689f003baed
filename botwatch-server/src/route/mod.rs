mod ingress;

use axum::Json;
use botwatch_proto::msg::HealthStatus;

pub use ingress::ingress_ws;

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus::ok())
}
