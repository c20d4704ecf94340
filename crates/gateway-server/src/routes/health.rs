//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use cp_protocol::PROTOCOL_VERSION;
use serde::Serialize;

use crate::state::Gateway;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    protocol: u32,
    connections: usize,
}

async fn health_check(State(gateway): State<Gateway>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: PROTOCOL_VERSION,
        connections: gateway.hub().connection_count().await,
    })
}

pub fn router() -> Router<Gateway> {
    Router::new().route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::state::test_support::build_gateway;

    #[tokio::test]
    async fn reports_protocol_and_connections() {
        let (gateway, _temp_dir) = build_gateway(|_| {}).await;
        let app = router().with_state(gateway);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["protocol"], PROTOCOL_VERSION);
        assert_eq!(payload["connections"], 0);
    }
}
