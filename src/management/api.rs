//! Management API Routes

use super::{
    auth::{auth_middleware, ApiAuth},
    handlers::*,
    types::ApiAuthConfig,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Management API router
pub struct ManagementApi;

impl ManagementApi {
    /// Create the management API router
    pub fn create_router(state: AppState, auth_config: ApiAuthConfig) -> Router {
        let auth = Arc::new(ApiAuth::new(auth_config));

        let public_routes = Router::new()
            .route("/health", get(health_check))
            .with_state(state.clone());

        let protected_routes = Router::new()
            // Relay lifecycle
            .route("/status", get(get_status))
            .route("/start", post(start_relay))
            .route("/stop", post(stop_relay))
            // Rules
            .route("/rules", get(get_rules))
            .route("/rules/:index", put(update_rule))
            .route("/keywords", post(register_keyword).delete(clear_keywords))
            .route("/keywords/holding", put(set_keyword_holding))
            // Held packets and output
            .route("/pending", get(get_pending))
            .route("/pending/flush", post(flush_pending))
            .route("/output", put(set_output))
            .route("/events", get(packet_events))
            .route("/metrics", get(metrics))
            .layer(middleware::from_fn_with_state(auth, auth_middleware))
            .with_state(state);

        Router::new()
            .nest("/api/v1", public_routes.merge(protected_routes))
            .layer(CorsLayer::permissive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::PacketHolder;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        AppState::new(
            PacketHolder::new(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        )
    }

    fn keyed_auth() -> ApiAuthConfig {
        ApiAuthConfig {
            enabled: true,
            api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_public_health_endpoint() {
        let app = ManagementApi::create_router(create_test_state(), keyed_auth());

        let request = Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_endpoint_without_auth() {
        let app = ManagementApi::create_router(create_test_state(), keyed_auth());

        let request = Request::builder()
            .uri("/api/v1/status")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_protected_endpoint_with_auth() {
        let app = ManagementApi::create_router(create_test_state(), keyed_auth());

        let request = Request::builder()
            .uri("/api/v1/status")
            .header("x-api-key", "test-key")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_prometheus_text() {
        let app = ManagementApi::create_router(create_test_state(), keyed_auth());

        let request = Request::builder()
            .uri("/api/v1/metrics")
            .header("x-api-key", "test-key")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
