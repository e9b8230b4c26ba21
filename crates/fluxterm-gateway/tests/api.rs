//! REST API tests, driven through axum's tower service interface (no TCP)
//! against the in-memory serial backend.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fluxterm_gateway::origin::OriginPolicy;
use support::{harness, Harness};

/// Helper: parse JSON response body.
async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(&bytes);
        panic!("not valid JSON: {text}");
    })
}

/// Helper: build a JSON POST request.
fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn call(h: &Harness, req: Request<Body>) -> axum::response::Response {
    fluxterm_gateway::app(h.state.clone())
        .oneshot(req)
        .await
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness(OriginPolicy::default());
    let resp = call(&h, get("/health")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["app"], "fluxterm");
}

#[tokio::test]
async fn lists_available_devices() {
    let h = harness(OriginPolicy::default());
    let resp = call(&h, get("/api/v1/ports")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let ports = body["ports"].as_array().unwrap();
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0]["name"], "/dev/ttyMOCK0");
    assert_eq!(ports[0]["is_usb"], true);
    assert_eq!(ports[0]["vid"], "2341");
    assert_eq!(ports[1]["is_usb"], false);
    assert!(ports[1].get("vid").is_none());
}

#[tokio::test]
async fn open_control_and_close_a_port() {
    let h = harness(OriginPolicy::default());

    let resp = call(&h, json_post("/api/v1/ports/open", serde_json::json!({"port": "COM7", "baud_rate": 57600}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["message"], "port opened successfully");
    assert_eq!(body["config"]["baud_rate"], 57600);
    assert_eq!(body["config"]["data_bits"], 8);

    let body = json_body(call(&h, get("/api/v1/ports/open")).await).await;
    assert_eq!(body["ports"], serde_json::json!(["COM7"]));

    let resp = call(&h, get("/api/v1/ports/COM7/status")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["name"], "COM7");
    assert_eq!(body["open"], true);
    assert_eq!(body["config"]["port"], "COM7");

    let resp = call(&h, json_post("/api/v1/ports/COM7/dtr", serde_json::json!({"value": true}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = call(&h, json_post("/api/v1/ports/COM7/rts", serde_json::json!({"value": false}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        *h.serial.lines.lock().unwrap(),
        vec![("COM7".to_string(), "dtr", true), ("COM7".to_string(), "rts", false)]
    );

    let resp = call(&h, json_post("/api/v1/ports/COM7/close", serde_json::json!({}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.state.serial_ports().is_empty().await);

    let resp = call(&h, json_post("/api/v1/ports/COM7/close", serde_json::json!({}))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp).await["error"], "port not found");
}

#[tokio::test]
async fn reopening_replaces_the_registered_handle() {
    let h = harness(OriginPolicy::default());
    for baud in [9600, 115_200] {
        let resp = call(&h, json_post("/api/v1/ports/open", serde_json::json!({"port": "COM7", "baud_rate": baud}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    assert_eq!(h.state.serial_ports().len().await, 1);
    let body = json_body(call(&h, get("/api/v1/ports/COM7/status")).await).await;
    assert_eq!(body["config"]["baud_rate"], 115_200);
}

#[tokio::test]
async fn unknown_ports_are_404() {
    let h = harness(OriginPolicy::default());
    let resp = call(&h, get("/api/v1/ports/COM9/status")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = call(&h, json_post("/api/v1/ports/COM9/dtr", serde_json::json!({"value": true}))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(h.serial.lines.lock().unwrap().is_empty());
}

#[tokio::test]
async fn bad_bodies_are_400() {
    let h = harness(OriginPolicy::default());

    let resp = call(&h, json_post("/api/v1/ports/open", serde_json::json!({"port": "COM7", "stop_bits": 5}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "invalid configuration");

    let resp = call(&h, json_post("/api/v1/ports/open", serde_json::json!({"baud_rate": 9600}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(h.state.serial_ports().is_empty().await);

    call(&h, json_post("/api/v1/ports/open", serde_json::json!({"port": "COM7"}))).await;
    let resp = call(&h, json_post("/api/v1/ports/COM7/rts", serde_json::json!({"level": "high"}))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn open_failure_is_500() {
    let h = harness(OriginPolicy::default());
    let resp = call(&h, json_post("/api/v1/ports/open", serde_json::json!({"port": "/dev/missing"}))).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("No such file"));
}

fn preflight(uri: &str, origin: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("OPTIONS")
        .header("origin", origin)
        .header("host", "127.0.0.1:8080")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap()
}

fn allowed_origin(resp: &axum::response::Response) -> Option<String> {
    resp.headers()
        .get("access-control-allow-origin")
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn cors_follows_the_origin_allow_list() {
    let h = harness(OriginPolicy::AllowList(vec!["http://localhost:5173".into()]));

    let resp = call(&h, preflight("/api/v1/ports/open", "http://evil.example")).await;
    assert_eq!(allowed_origin(&resp), None, "foreign origin must not be granted");

    let resp = call(&h, preflight("/api/v1/ports/open", "http://localhost:5173")).await;
    assert_eq!(allowed_origin(&resp).as_deref(), Some("http://localhost:5173"));
}

#[tokio::test]
async fn cors_defaults_to_same_host_only() {
    let h = harness(OriginPolicy::default());

    let resp = call(&h, preflight("/api/v1/ports/COM7/dtr", "http://evil.example")).await;
    assert_eq!(allowed_origin(&resp), None);

    let resp = call(&h, preflight("/api/v1/ports/COM7/dtr", "http://127.0.0.1:8080")).await;
    assert_eq!(allowed_origin(&resp).as_deref(), Some("http://127.0.0.1:8080"));
}

#[tokio::test]
async fn cors_allow_any_grants_wildcard() {
    let h = harness(OriginPolicy::AllowAny);
    let resp = call(&h, preflight("/api/v1/ports/open", "http://anything.example")).await;
    assert_eq!(allowed_origin(&resp).as_deref(), Some("*"));
}
