//! Integration tests for the node API endpoints

#[allow(dead_code)]
#[path = "../src/api.rs"]
mod api;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use node_lib::{
    health::components, NodeFacade, NodeSettings, Service, ServiceRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<api::AppState>) {
    let node = NodeFacade::new(NodeSettings::new(
        "api-test",
        1024,
        Duration::from_millis(1000),
        0.9,
        true,
    ))
    .unwrap();
    node.set_verbose(false);
    node.add_service(Service::new("a", 128, 120.0).with_target_allocation(2.0))
        .await
        .unwrap();

    let state = Arc::new(api::AppState::new(Arc::new(node)));
    let router = api::create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .node
        .health()
        .set_degraded(components::LOG_SINK, "allocation record emission failed")
        .await;

    let (status, health) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert!(health["components"]["log_sink"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .node
        .health()
        .set_unhealthy(components::CONTROL_LOOP, "Control loop stopped")
        .await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_control_loop() {
    let (app, state) = setup_test_app().await;

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.node.start().await.unwrap();
    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    state.node.stop().await;
    let (status, _) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;
    state.node.tick().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("elastic_node_tick_latency_seconds_bucket"));
    assert!(metrics_text.contains("elastic_node_ticks_total"));
    assert!(metrics_text.contains("elastic_node_applied_allocation"));
}

#[tokio::test]
async fn test_services_lists_pools() {
    let (app, _state) = setup_test_app().await;

    let (status, services) = get(app, "/services").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(services[0]["name"], "a");
    assert_eq!(services[0]["pool_size"], 2);
    assert_eq!(services[0]["memory"], 128);
}

#[tokio::test]
async fn test_history_is_consumed_once() {
    let (app, state) = setup_test_app().await;
    assert_eq!(
        state
            .node
            .execute(ServiceRequest::for_service("a", Duration::from_millis(1))),
        node_lib::ExecuteOutcome::Accepted
    );
    state.node.tick().await;

    let (status, history) = get(app.clone(), "/services/a/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["epoch"], 1);

    let (_, history) = get(app, "/services/a/history").await;
    assert!(history.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_history_of_unknown_service_is_404() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = get(app, "/services/ghost/history").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_diagnostics_before_first_tick() {
    let (app, _state) = setup_test_app().await;

    let (status, diagnostics) = get(app, "/diagnostics").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(diagnostics["ticks"], 0);
    assert_eq!(diagnostics["last_threads"], -1);
}
