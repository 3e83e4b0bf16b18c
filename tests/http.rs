//! End-to-end exchanges through the HTTP mux.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use fns::config::Config;
use fns::endpoint::{FnHandler, Service};
use fns::endpoints::Endpoints;
use fns::errors::CodeError;
use fns::handler::{
    FnsHandler, HEADER_DEVICE_ID, HEADER_ENDPOINT_ID, HEADER_ENDPOINT_VERSION,
    HEADER_HANDLE_LATENCY, HEADER_REQUEST_ID, HEADER_REQUEST_TIMEOUT, HEADER_REQUEST_VERSION,
};
use fns::metrics::{Metric, ReportSink};
use fns::request::Request;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::{Value, json};

struct Echo;

#[async_trait]
impl FnHandler for Echo {
    fn name(&self) -> &str {
        "get"
    }

    async fn handle(&self, request: Arc<Request>) -> Result<Value, CodeError> {
        Ok(request.param().scan::<Value>()?.unwrap_or(Value::Null))
    }
}

struct List;

#[async_trait]
impl FnHandler for List {
    fn name(&self) -> &str {
        "list"
    }

    fn readonly(&self) -> bool {
        true
    }

    async fn handle(&self, request: Arc<Request>) -> Result<Value, CodeError> {
        Ok(request.param().scan::<Value>()?.unwrap_or(Value::Null))
    }
}

struct Wait;

#[async_trait]
impl FnHandler for Wait {
    fn name(&self) -> &str {
        "wait"
    }

    async fn handle(&self, _request: Arc<Request>) -> Result<Value, CodeError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(json!("done"))
    }
}

struct Counted(Arc<AtomicUsize>);

#[async_trait]
impl FnHandler for Counted {
    fn name(&self) -> &str {
        "count"
    }

    async fn handle(&self, _request: Arc<Request>) -> Result<Value, CodeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        // Long enough that every collapsed caller arrives while in flight.
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(json!({"ran": true}))
    }
}

struct Hidden;

#[async_trait]
impl FnHandler for Hidden {
    fn name(&self) -> &str {
        "peek"
    }

    async fn handle(&self, _request: Arc<Request>) -> Result<Value, CodeError> {
        Ok(json!("secret"))
    }
}

async fn mux_with(config: Config) -> FnsHandler {
    let endpoints = Endpoints::builder(config)
        .deploy(Service::new("users").with_fn(Echo).with_fn(List))
        .deploy(Service::new("slow").with_fn(Wait))
        .deploy(Service::new("vault").internal().with_fn(Hidden))
        .build()
        .await
        .unwrap();
    FnsHandler::new(endpoints)
}

async fn mux() -> FnsHandler {
    mux_with(Config::default()).await
}

fn post(path: &str) -> http::request::Builder {
    http::Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("Content-Type", "application/json")
}

fn get(path: &str) -> http::request::Builder {
    http::Request::builder().method(Method::GET).uri(path)
}

async fn send(
    builder: http::request::Builder,
    body: Value,
    handler: &FnsHandler,
) -> (StatusCode, http::HeaderMap, Value) {
    let req = builder
        .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap();
    exchange(req, handler).await
}

async fn send_empty(
    builder: http::request::Builder,
    handler: &FnsHandler,
) -> (StatusCode, http::HeaderMap, Value) {
    let req = builder.body(Full::new(Bytes::new())).unwrap();
    exchange(req, handler).await
}

async fn exchange(
    req: http::Request<Full<Bytes>>,
    handler: &FnsHandler,
) -> (StatusCode, http::HeaderMap, Value) {
    let response = handler.dispatch(req).await;
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
}

#[tokio::test]
async fn post_echo_round_trip() {
    let handler = mux().await;
    let (status, headers, body) = send(
        post("/users/get").header(HEADER_DEVICE_ID, "d-1"),
        json!({"id": "1"}),
        &handler,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "1"}));
    assert!(headers.contains_key(HEADER_REQUEST_ID));
    assert!(headers.contains_key(HEADER_HANDLE_LATENCY));
    assert!(headers.contains_key(HEADER_ENDPOINT_ID));
    assert_eq!(headers.get(HEADER_ENDPOINT_VERSION).unwrap(), "1.0.0");
    assert_eq!(headers.get("Server").unwrap(), "FNS");
    assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
}

#[tokio::test]
async fn supplied_request_id_is_echoed() {
    let handler = mux().await;
    let (_, headers, _) = send(
        post("/users/get")
            .header(HEADER_DEVICE_ID, "d-1")
            .header(HEADER_REQUEST_ID, "r-42"),
        json!({}),
        &handler,
    )
    .await;
    assert_eq!(headers.get(HEADER_REQUEST_ID).unwrap(), "r-42");
}

#[tokio::test]
async fn missing_device_id_is_not_acceptable() {
    let handler = mux().await;
    let (status, _, body) = send(post("/users/get"), json!({"id": "1"}), &handler).await;

    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
    assert_eq!(body["code"], 406);
    assert_eq!(body["name"], "***NOT ACCEPTABLE***");
    assert_eq!(body["meta"]["path"], "/users/get");
}

#[tokio::test]
async fn version_mismatch_is_not_found() {
    let handler = mux().await;
    let (status, _, body) = send(
        post("/users/get")
            .header(HEADER_DEVICE_ID, "d-1")
            .header(HEADER_REQUEST_VERSION, "users=v2.0.0:v3.0.0"),
        json!({"id": "1"}),
        &handler,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn malformed_version_header_is_not_acceptable() {
    let handler = mux().await;
    let (status, _, _) = send(
        post("/users/get")
            .header(HEADER_DEVICE_ID, "d-1")
            .header(HEADER_REQUEST_VERSION, "users=oops"),
        json!({}),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_ACCEPTABLE);
}

/// Captures every metric the reporter drains.
fn capture_sink() -> (Arc<Mutex<Vec<Metric>>>, ReportSink) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink_captured = captured.clone();
    let sink: ReportSink = Box::new(move |metric| {
        let captured = sink_captured.clone();
        async move {
            captured.lock().unwrap().push(metric);
            Ok::<(), CodeError>(())
        }
        .boxed()
    });
    (captured, sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn identical_concurrent_posts_collapse_to_one_execution() {
    let counter = Arc::new(AtomicUsize::new(0));
    let (reports, sink) = capture_sink();
    let endpoints = Endpoints::builder(Config::default())
        .deploy(Service::new("users").with_fn(Counted(counter.clone())))
        .report_sink(sink)
        .build()
        .await
        .unwrap();
    let handler = Arc::new(FnsHandler::new(endpoints));

    let mut calls = Vec::new();
    for _ in 0..1000 {
        let handler = handler.clone();
        calls.push(tokio::spawn(async move {
            send(
                post("/users/count")
                    .header(HEADER_DEVICE_ID, "d-1")
                    .header("Authorization", "Bearer t-1"),
                json!({"id": "1"}),
                &handler,
            )
            .await
        }));
    }
    for call in calls {
        let (status, _, body) = call.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ran": true}));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Reports drain off the hot path; wait for the full cohort, then the
    // shared flag must be set on every collapsed caller's record.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let reports = loop {
        {
            let drained = reports.lock().unwrap();
            if drained.len() >= 1000 {
                break drained.clone();
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "metric reports never drained"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let shared = reports.iter().filter(|m| m.shared).count();
    assert!(shared >= 999, "expected >= 999 shared metrics, got {shared}");
    assert!(reports.iter().all(|m| m.succeed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_timeout_header_bounds_the_await() {
    let handler = mux().await;
    let (status, _, body) = send(
        post("/slow/wait")
            .header(HEADER_DEVICE_ID, "d-1")
            .header(HEADER_REQUEST_TIMEOUT, "50"),
        json!({}),
        &handler,
    )
    .await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["code"], 408);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturation_surfaces_too_many_requests_then_recovers() {
    let mut config = Config::default();
    config.runtime.max_workers = 2;
    let handler = Arc::new(mux_with(config).await);

    let mut held = Vec::new();
    for i in 0..2 {
        let handler = handler.clone();
        held.push(tokio::spawn(async move {
            send(
                post("/slow/wait").header(HEADER_DEVICE_ID, "d-1"),
                json!({"n": i}),
                &handler,
            )
            .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _, body) = send(
        post("/slow/wait").header(HEADER_DEVICE_ID, "d-1"),
        json!({"n": 99}),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["name"], "***TOO MANY REQUESTS***");

    for call in held {
        let (status, _, _) = call.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = send(
        post("/slow/wait").header(HEADER_DEVICE_ID, "d-1"),
        json!({"n": 100}),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn readonly_fn_accepts_get_with_query_params() {
    let handler = mux().await;
    let (status, _, body) = send_empty(
        get("/users/list?id=1&page=2").header(HEADER_DEVICE_ID, "d-1"),
        &handler,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "1", "page": "2"}));
}

#[tokio::test]
async fn get_on_non_readonly_fn_is_refused() {
    let handler = mux().await;
    let (status, _, _) = send_empty(
        get("/users/get?id=1").header(HEADER_DEVICE_ID, "d-1"),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_without_json_content_type_is_bad_request() {
    let handler = mux().await;
    let (status, _, _) = send_empty(
        http::Request::builder()
            .method(Method::POST)
            .uri("/users/get")
            .header("Content-Type", "text/plain")
            .header(HEADER_DEVICE_ID, "d-1"),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn internal_endpoint_has_no_external_surface() {
    let handler = mux().await;
    let (status, _, _) = send(
        post("/vault/peek").header(HEADER_DEVICE_ID, "d-1"),
        json!({}),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_path_is_bad_request() {
    let handler = mux().await;
    let (status, _, _) = send(
        post("/users").header(HEADER_DEVICE_ID, "d-1"),
        json!({}),
        &handler,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn documents_route_serves_the_visible_snapshot() {
    let mut config = Config::default();
    config.transport.documents = true;
    let handler = mux_with(config).await;

    let (status, _, body) = send_empty(get("/documents"), &handler).await;

    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|info| info["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"users"));
    assert!(names.contains(&"slow"));
    // Internal endpoints never appear.
    assert!(!names.contains(&"vault"));
}

#[tokio::test]
async fn documents_route_is_off_by_default() {
    let handler = mux().await;
    let (status, _, _) = send_empty(get("/documents"), &handler).await;
    // Without the flag the path falls through to mux parsing.
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
