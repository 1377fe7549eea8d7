//! Embedding and generation clients against an in-process mock of the
//! OpenAI API: retry on transient statuses, fail fast on terminal ones.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use manual_copilot::config::{EmbeddingConfig, GenerationConfig};
use manual_copilot::{embedding, generation};
use manual_copilot_core::embedding::EmbeddingProvider;
use manual_copilot_core::generation::{ChatMessage, GenerationProvider, GenerationRequest};
use manual_copilot_core::{FailureKind, RagError};

type Calls = Arc<AtomicUsize>;

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn embedding_config(url: &str) -> EmbeddingConfig {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    EmbeddingConfig {
        provider: "openai".to_string(),
        model: Some("text-embedding-3-small".to_string()),
        dims: Some(3),
        url: Some(url.to_string()),
        max_retries: 3,
        timeout_secs: 5,
        backoff_ms: 1,
        ..EmbeddingConfig::default()
    }
}

fn generation_config(url: &str) -> GenerationConfig {
    std::env::set_var("OPENAI_API_KEY", "test-key");
    GenerationConfig {
        provider: "openai".to_string(),
        model: Some("gpt-4o-mini".to_string()),
        url: Some(url.to_string()),
        max_retries: 2,
        timeout_secs: 5,
        backoff_ms: 1,
        ..GenerationConfig::default()
    }
}

fn embeddings_for(body: &Value) -> Value {
    let inputs = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
    let data: Vec<Value> = (0..inputs)
        .rev()
        .map(|i| json!({"index": i, "embedding": [1.0, 0.0, i as f64]}))
        .collect();
    json!({ "data": data })
}

async fn unavailable_once(State(calls): State<Calls>, Json(body): Json<Value>) -> Response {
    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
    }
    Json(embeddings_for(&body)).into_response()
}

async fn unauthorized(State(calls): State<Calls>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    (StatusCode::UNAUTHORIZED, r#"{"error":{"code":"invalid_api_key"}}"#).into_response()
}

async fn always_unavailable(State(calls): State<Calls>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::BAD_GATEWAY.into_response()
}

async fn out_of_quota(State(calls): State<Calls>) -> Response {
    calls.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::TOO_MANY_REQUESTS,
        r#"{"error":{"code":"insufficient_quota"}}"#,
    )
        .into_response()
}

async fn rate_limited_once(State(calls): State<Calls>) -> Response {
    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::TOO_MANY_REQUESTS, r#"{"error":"rate_limit"}"#).into_response();
    }
    Json(json!({
        "choices": [{
            "finish_reason": "stop",
            "message": {"role": "assistant", "content": "Set the relief valve to 3200 psi [Unit 102 | press.pdf | Page 1]."}
        }]
    }))
    .into_response()
}

fn request() -> GenerationRequest {
    GenerationRequest {
        system: "You are an expert equipment technician.".to_string(),
        messages: vec![ChatMessage::user("Relief valve setting for unit 102?")],
        passages: Vec::new(),
    }
}

#[tokio::test]
async fn test_embedding_retries_transient_failure() {
    let calls = Calls::default();
    let url = spawn(
        Router::new()
            .route("/v1/embeddings", post(unavailable_once))
            .with_state(calls.clone()),
    )
    .await;

    let provider = embedding::create_provider(&embedding_config(&url)).unwrap();
    let vectors = provider
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0, 1.0]]);
}

#[tokio::test]
async fn test_embedding_bad_key_fails_without_retry() {
    let calls = Calls::default();
    let url = spawn(
        Router::new()
            .route("/v1/embeddings", post(unauthorized))
            .with_state(calls.clone()),
    )
    .await;

    let provider = embedding::create_provider(&embedding_config(&url)).unwrap();
    let err = provider.embed(&["a".to_string()]).await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        RagError::EmbeddingService {
            kind: FailureKind::Terminal,
            ..
        }
    ));
}

#[tokio::test]
async fn test_embedding_gives_up_after_max_retries() {
    let calls = Calls::default();
    let url = spawn(
        Router::new()
            .route("/v1/embeddings", post(always_unavailable))
            .with_state(calls.clone()),
    )
    .await;

    let provider = embedding::create_provider(&embedding_config(&url)).unwrap();
    let err = provider.embed(&["a".to_string()]).await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_generation_retries_rate_limit() {
    let calls = Calls::default();
    let url = spawn(
        Router::new()
            .route("/v1/chat/completions", post(rate_limited_once))
            .with_state(calls.clone()),
    )
    .await;

    let provider = generation::create_provider(&generation_config(&url)).unwrap();
    let text = provider.generate(&request()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(text.contains("[Unit 102 | press.pdf | Page 1]"));
}

#[tokio::test]
async fn test_generation_quota_exhaustion_is_terminal() {
    let calls = Calls::default();
    let url = spawn(
        Router::new()
            .route("/v1/chat/completions", post(out_of_quota))
            .with_state(calls.clone()),
    )
    .await;

    let provider = generation::create_provider(&generation_config(&url)).unwrap();
    let err = provider.generate(&request()).await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        RagError::GenerationService {
            kind: FailureKind::Terminal,
            ..
        }
    ));
}
