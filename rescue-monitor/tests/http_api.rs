use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use rescue_devkit::test_utils::{test_channel, test_location, TestHarness};
use rescue_monitor::http::{build_router, AppState, API_KEY_HEADER};
use serde_json::{json, Value};
use tower::ServiceExt;

const KEY: &str = "test-key";

fn router(h: &TestHarness, api_key: Option<&str>) -> Router {
    build_router(AppState {
        monitor: h.monitor.clone(),
        api_key: api_key.map(str::to_string),
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(API_KEY_HEADER, KEY)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(API_KEY_HEADER, KEY)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn activation() -> Value {
    json!({
        "location": test_location(),
        "channel": {
            "broker_host": test_channel().broker_host,
            "broker_port": 1883,
            "channel": "orders/downtown",
            "username": "watcher",
            "password": "s3cret"
        }
    })
}

#[tokio::test]
async fn test_health_is_open_and_everything_else_needs_the_key() {
    let h = TestHarness::new().unwrap();
    let app = router(&h, Some(KEY));

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/monitor").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/monitor")
        .header(API_KEY_HEADER, "nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, get("/monitor")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(false));
}

#[tokio::test]
async fn test_no_configured_key_locks_the_api() {
    let h = TestHarness::new().unwrap();
    let app = router(&h, None);
    let (status, _) = send(&app, get("/monitor")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_activate_status_and_deactivate() {
    let h = TestHarness::new().unwrap();
    let app = router(&h, Some(KEY));

    let mut bad = activation();
    bad["channel"]["channel"] = json!("");
    let (status, body) = send(&app, post("/monitor/activate", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("channel"));

    let (status, body) = send(&app, post("/monitor/activate", activation())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["location"]["name"], json!("Downtown"));
    assert_eq!(body["cancelled_count"], json!(0));
    h.wait_connected().await.unwrap();

    let (status, body) = send(&app, get("/monitor")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(true));
    assert_eq!(body["connected"], json!(true));
    assert_eq!(body["state"]["broker"], json!("broker.test:1883"));
    assert!(!body.to_string().contains("s3cret"));

    let (_, body) = send(&app, get("/monitor/connectivity")).await;
    assert_eq!(body["connected"], json!(true));

    let (_, body) = send(&app, get("/monitor/liveness")).await;
    assert_eq!(body["status_line"], json!("Monitoring: Downtown"));
    assert_eq!(body["power"], json!("unknown"));

    let (status, body) = send(&app, post("/monitor/deactivate", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("deactivated"));

    let (_, body) = send(&app, get("/monitor")).await;
    assert_eq!(body["active"], json!(false));
    assert_eq!(body["connected"], json!(false));
    assert!(body["state"].is_null());
}

#[tokio::test]
async fn test_test_alert_fires_the_sink() {
    let h = TestHarness::new().unwrap();
    let app = router(&h, Some(KEY));

    let (status, body) = send(&app, post("/monitor/test-alert", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fired"], json!(true));
    assert_eq!(body["alert"]["reason"], json!("test"));
    assert_eq!(h.alerts.count(), 1);
}
