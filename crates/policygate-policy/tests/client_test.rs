//! Policy client tests against an in-process engine

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use policygate_core::{build, Event, RegistrationEvent, Verdict};
use policygate_policy::{EngineError, OpaClient, OpaClientConfig, PolicyClient, RetryPolicy};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DECISION_PATH: &str = "/v1/data/sdlc/governance/allow";

#[derive(Clone)]
struct Engine {
    hits: Arc<AtomicUsize>,
    status: StatusCode,
    body: &'static str,
    delay: Duration,
}

async fn decide(State(engine): State<Engine>, Json(query): Json<Value>) -> (StatusCode, String) {
    engine.hits.fetch_add(1, Ordering::SeqCst);
    assert!(query.get("input").is_some(), "query must wrap the request in `input`");
    tokio::time::sleep(engine.delay).await;
    (engine.status, engine.body.to_string())
}

async fn spawn_engine(status: StatusCode, body: &'static str, delay: Duration) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let engine = Engine {
        hits: hits.clone(),
        status,
        body,
        delay,
    };
    let app = Router::new()
        .route(DECISION_PATH, post(decide))
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}{}", addr, DECISION_PATH), hits)
}

fn client(url: String, attempts: u32, timeout: Duration) -> OpaClient {
    OpaClient::new(OpaClientConfig {
        url,
        timeout,
        retry: RetryPolicy::new(attempts, Duration::from_millis(5)),
    })
    .unwrap()
}

fn registration() -> policygate_core::DecisionRequest {
    build(&Event::Registration(RegistrationEvent::new("alice", "t1"))).unwrap()
}

#[tokio::test]
async fn test_object_allow() {
    let (url, hits) = spawn_engine(StatusCode::OK, r#"{"result": {"allow": true}}"#, Duration::ZERO).await;
    let verdict = client(url, 3, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap();

    assert_eq!(verdict, Verdict::allow());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_object_deny_is_not_retried() {
    let (url, hits) = spawn_engine(
        StatusCode::OK,
        r#"{"result": {"allow": false, "reasons": ["quota exceeded"]}}"#,
        Duration::ZERO,
    )
    .await;
    let verdict = client(url, 3, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap();

    assert_eq!(verdict, Verdict::deny(vec!["quota exceeded".to_string()]));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_boolean_result() {
    let (url, _) = spawn_engine(StatusCode::OK, r#"{"result": true}"#, Duration::ZERO).await;
    let verdict = client(url, 1, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap();
    assert!(verdict.allow);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let (url, hits) = spawn_engine(StatusCode::SERVICE_UNAVAILABLE, "", Duration::ZERO).await;
    let err = client(url, 3, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Status(503)));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_errors_are_terminal() {
    let (url, hits) = spawn_engine(StatusCode::BAD_REQUEST, r#"{"code": "invalid_parameter"}"#, Duration::ZERO).await;
    let err = client(url, 3, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Status(400)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_result_is_terminal() {
    let (url, hits) = spawn_engine(StatusCode::OK, "{}", Duration::ZERO).await;
    let err = client(url, 3, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::MissingResult));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unparseable_body() {
    let (url, _) = spawn_engine(StatusCode::OK, "not json", Duration::ZERO).await;
    let err = client(url, 1, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MalformedBody(_)));
}

#[tokio::test]
async fn test_slow_engine_times_out() {
    let (url, _) = spawn_engine(StatusCode::OK, r#"{"result": true}"#, Duration::from_millis(500)).await;
    let err = client(url, 1, Duration::from_millis(50))
        .evaluate(&registration())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(format!("http://{}{}", addr, DECISION_PATH), 2, Duration::from_secs(1))
        .evaluate(&registration())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, EngineError::Transport(_)));
}

#[tokio::test]
async fn test_request_body_shape() {
    let seen = Arc::new(std::sync::Mutex::new(None));
    let captured = seen.clone();
    let app = Router::new().route(
        DECISION_PATH,
        post(move |Json(query): Json<Value>| {
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = Some(query);
                Json(json!({"result": true}))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    client(format!("http://{}{}", addr, DECISION_PATH), 1, Duration::from_secs(2))
        .evaluate(&registration())
        .await
        .unwrap();

    let query = seen.lock().unwrap().clone().unwrap();
    assert_eq!(query["input"]["action"], "register_template");
    assert_eq!(query["input"]["actor"], "alice");
    assert_eq!(query["input"]["resource"]["template"], "t1");
}
