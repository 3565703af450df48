use actix_web::http::StatusCode;
use actix_web::test;
use bytes::Bytes;
use serde_json::Value;

use super::*;
use crate::signals::SignalSpec;

async fn state_for(settings: Settings) -> ServerState {
    ServerState::from_settings(&settings)
        .await
        .expect("Could not build ServerState")
}

fn backpressure_settings(monitoring_base_url: &str) -> Settings {
    let mut settings = Settings::test_settings();
    settings.middleware.enable_backpressure = true;
    settings.middleware.backpressure.monitoring_base_url = monitoring_base_url.to_owned();
    settings.middleware.backpressure.window_min = 2;
    settings.middleware.backpressure.window_max = 100;
    settings.middleware.backpressure.signals = vec![SignalSpec {
        query: "sum(rate(http_requests_total[5m]))".to_owned(),
        name: Some("request_rate".to_owned()),
        warn: 10.0,
        emergency: 100.0,
        curve: 4.0,
    }];
    settings
}

#[actix_web::test]
async fn test_heartbeat_reports_controller_state() {
    let state = state_for(backpressure_settings("http://127.0.0.1:1")).await;
    let app = test::init_service(build_app!(state)).await;

    let request = test::TestRequest::get().uri("/__heartbeat__").to_request();
    let body: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["status"], "OK");
    assert_eq!(body["watermark"], 2);
    assert_eq!(body["active"], 0);
    assert_eq!(body["allowance"], 1.0);
}

#[actix_web::test]
async fn test_lbheartbeat_and_version() {
    let state = state_for(Settings::test_settings()).await;
    let app = test::init_service(build_app!(state)).await;

    let request = test::TestRequest::get().uri("/__lbheartbeat__").to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let request = test::TestRequest::get().uri("/__version__").to_request();
    let body: Value = test::call_and_read_body_json(&app, request).await;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
}

#[actix_web::test]
async fn test_proxy_forwards_requests_upstream() {
    let mut upstream = mockito::Server::new_async().await;
    let mock = upstream
        .mock("POST", "/api/v1/query")
        .match_header("x-custom", "carried")
        .match_body("query=up")
        .with_status(200)
        .with_header("x-upstream", "yes")
        .with_body(r#"{"status":"success"}"#)
        .create_async()
        .await;

    let mut settings = Settings::test_settings();
    settings.upstream_url = upstream.url();
    let state = state_for(settings).await;
    let app = test::init_service(build_app!(state)).await;

    let request = test::TestRequest::post()
        .uri("/api/v1/query")
        .insert_header(("x-custom", "carried"))
        .insert_header(("content-type", "application/x-www-form-urlencoded"))
        .set_payload("query=up")
        .to_request();
    let response = test::call_service(&app, request).await;
    mock.assert_async().await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    let body = test::read_body(response).await;
    assert_eq!(body, Bytes::from_static(b"{\"status\":\"success\"}"));
}

#[actix_web::test]
async fn test_blocked_request_gets_the_429_envelope() {
    let mut settings = Settings::test_settings();
    settings.middleware.enable_blocker = true;
    settings.middleware.block_patterns = vec!["x-user-agent=service.*".to_owned()];
    let state = state_for(settings).await;
    let app = test::init_service(build_app!(state)).await;

    let request = test::TestRequest::get()
        .uri("/api/v1/query?query=up")
        .insert_header(("x-user-agent", "service1"))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json; charset=utf-8"
    );

    let body: Value = serde_json::from_slice(&test::read_body(response).await).unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["errorType"], "throttle-proxy");
    assert!(body["error"].as_str().unwrap().contains("service1"));
}

#[actix_web::test]
async fn test_upstream_failure_gets_the_500_envelope() {
    let mut settings = Settings::test_settings();
    // Nothing listens here; the transport reports an upstream error.
    settings.upstream_url = "http://127.0.0.1:1".to_owned();
    let state = state_for(settings).await;
    let app = test::init_service(build_app!(state)).await;

    let request = test::TestRequest::get().uri("/whatever").to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: Value = serde_json::from_slice(&test::read_body(response).await).unwrap();
    assert_eq!(body["errorType"], "throttle-proxy");
}
