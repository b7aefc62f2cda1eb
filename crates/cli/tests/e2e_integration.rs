//! End-to-end tests for the nosrelay chat pipeline.
//!
//! A local axum server impersonates the upstream LLM provider and the
//! Birdeye price API. The real HTTP upstream, price source and gateway
//! router run against it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Json, Query, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use nosrelay_config::{AppConfig, PriceConfig};
use nosrelay_core::{
    BudgetPlanner, ContextFact, ErrorKind, Message, ModelSpec, Plan, Relay, RelayOutcome,
    Upstream, UpstreamRequest,
};
use nosrelay_gateway::{RelayState, build_router};
use nosrelay_providers::{OpenAiCompatUpstream, context_resolver};

// ── Fake Upstream ────────────────────────────────────────────────────────

/// What the fake servers saw.
#[derive(Clone, Default)]
struct Recorded {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<String>>>,
    price_lookups: Arc<Mutex<Vec<String>>>,
}

impl Recorded {
    fn record(&self, headers: &HeaderMap, body: Value) {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.auth.lock().unwrap().push(auth);
        self.bodies.lock().unwrap().push(body);
    }

    fn last_body(&self) -> Value {
        self.bodies.lock().unwrap().last().cloned().unwrap()
    }

    fn last_user_content(&self) -> String {
        let body = self.last_body();
        let messages = body["messages"].as_array().unwrap();
        messages.last().unwrap()["content"]
            .as_str()
            .unwrap()
            .to_string()
    }
}

fn delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
    )
}

fn sse(body: impl Into<Body>) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body.into()).into_response()
}

async fn chat_ok(
    State(rec): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    rec.record(&headers, body);
    let mut events = String::from("data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n");
    for text in ["Hello", ", ", "world"] {
        events.push_str(&delta(text));
    }
    events.push_str("data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n");
    events.push_str("data: [DONE]\n\n");
    sse(events)
}

async fn chat_unauthorized(
    State(rec): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    rec.record(&headers, body);
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {
            "message": "Incorrect API key provided",
            "type": "invalid_request_error"
        }})),
    )
        .into_response()
}

async fn chat_rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": {"message": "Rate limit reached for requests"}})),
    )
        .into_response()
}

async fn chat_server_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response()
}

async fn chat_garbage() -> Response {
    sse("<html><body>502 Bad Gateway</body></html>\n")
}

/// Three deltas, then the connection dies without `[DONE]`.
async fn chat_then_drop() -> Response {
    let frames = futures::stream::unfold(0u8, |step| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let item = match step {
            0 => Ok(delta("one ")),
            1 => Ok(delta("two ")),
            2 => Ok(delta("three")),
            3 => Err(std::io::Error::other("upstream crashed")),
            _ => return None,
        };
        Some((item, step + 1))
    });
    sse(Body::from_stream(frames))
}

/// Accepts the request and never answers.
async fn chat_silent() -> Response {
    std::future::pending().await
}

/// Sends headers, then no body bytes at all.
async fn chat_headers_only() -> Response {
    sse(Body::from_stream(
        futures::stream::pending::<Result<String, std::io::Error>>(),
    ))
}

async fn chat_endless_line() -> Response {
    sse("x".repeat(200 * 1024))
}

async fn chat_huge_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "e".repeat(1024 * 1024)).into_response()
}

async fn birdeye_price(
    State(rec): State<Recorded>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some("be-key") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    rec.price_lookups
        .lock()
        .unwrap()
        .push(params.get("address").cloned().unwrap_or_default());
    Json(json!({"success": true, "data": {"value": 1.2345, "updateUnixTime": 1700000000}}))
        .into_response()
}

async fn birdeye_down() -> Response {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

/// Serve `router` on an ephemeral local port.
async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("listener local_addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("fake server");
    });
    format!("http://{addr}")
}

async fn fake_provider(rec: Recorded) -> String {
    let router = Router::new()
        .route("/ok/v1/chat/completions", post(chat_ok))
        .route("/unauthorized/v1/chat/completions", post(chat_unauthorized))
        .route("/limited/v1/chat/completions", post(chat_rate_limited))
        .route("/broken/v1/chat/completions", post(chat_server_error))
        .route("/garbage/v1/chat/completions", post(chat_garbage))
        .route("/drop/v1/chat/completions", post(chat_then_drop))
        .route("/silent/v1/chat/completions", post(chat_silent))
        .route("/headers/v1/chat/completions", post(chat_headers_only))
        .route("/endless/v1/chat/completions", post(chat_endless_line))
        .route("/huge-error/v1/chat/completions", post(chat_huge_error))
        .route("/defi/price", get(birdeye_price))
        .route("/down/defi/price", get(birdeye_down))
        .with_state(rec);
    spawn_server(router).await
}

// ── Gateway Helpers ─────────────────────────────────────────────────────

fn gateway_config(base: &str, route: &str, price: PriceConfig) -> AppConfig {
    let mut config = AppConfig::default();
    config.relay.default_upstream_url = format!("{base}/{route}/v1/chat/completions");
    config.relay.api_key = Some("sk-test".into());
    config.price = price;
    config
}

fn router_for(config: &AppConfig) -> Router {
    let state = Arc::new(RelayState::from_config(config).expect("gateway state"));
    build_router(state, &config.gateway)
}

fn gateway(base: &str, route: &str, price: PriceConfig) -> Router {
    router_for(&gateway_config(base, route, price))
}

fn no_price() -> PriceConfig {
    PriceConfig {
        enabled: false,
        ..PriceConfig::default()
    }
}

async fn chat(app: Router, body: Value) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn ask(question: &str) -> Value {
    json!({
        "model": {"id": "gpt-3.5-turbo", "tokenLimit": 4096},
        "messages": [{"role": "user", "content": question}],
    })
}

// ── E2E: Streaming Chat ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_streams_answer_as_plain_text() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;

    let (status, body) = chat(gateway(&base, "ok", no_price()), ask("Hi")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello, world");

    // Wire format sent upstream
    let sent = rec.last_body();
    assert_eq!(sent["model"], "gpt-3.5-turbo");
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["max_tokens"], 1000);
    assert_eq!(sent["messages"][0]["role"], "system");
    assert!(
        sent["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("Nosana")
    );
    assert_eq!(sent["messages"][1], json!({"role": "user", "content": "Hi"}));
    assert_eq!(rec.auth.lock().unwrap().last().unwrap(), "Bearer sk-test");
}

#[tokio::test]
async fn e2e_caller_key_and_url_are_used() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;

    let mut body = ask("Hi");
    body["key"] = json!("sk-caller");
    body["url"] = json!(format!("{base}/ok/v1/chat/completions"));
    body["temperature"] = json!(0.5);

    // Configured default points at a failing route; the caller's url wins.
    let (status, text) = chat(gateway(&base, "unauthorized", no_price()), body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Hello, world");
    assert_eq!(rec.auth.lock().unwrap().last().unwrap(), "Bearer sk-caller");
    assert_eq!(rec.last_body()["temperature"], 0.5);
}

#[tokio::test]
async fn e2e_search_results_reach_upstream() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;

    let mut body = ask("How do I deploy?");
    body["searchResults"] = json!(["Deploy with the CLI.", "Jobs need a market."]);
    let (status, _) = chat(gateway(&base, "ok", no_price()), body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        rec.last_user_content(),
        "How do I deploy?\n\nContext:\nDeploy with the CLI.\n\nJobs need a market."
    );
}

#[tokio::test]
async fn e2e_mid_stream_drop_keeps_delivered_text() {
    let rec = Recorded::default();
    let base = fake_provider(rec).await;

    let (status, body) = chat(gateway(&base, "drop", no_price()), ask("Count")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "one two three");
}

// ── E2E: Price Context ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_price_question_fetches_live_price() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;
    let price = PriceConfig {
        endpoint: format!("{base}/defi/price"),
        api_key: Some("be-key".into()),
        ..PriceConfig::default()
    };

    let (status, _) = chat(
        gateway(&base, "ok", price.clone()),
        ask("What's the nosana price right now?"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let content = rec.last_user_content();
    assert!(content.starts_with("What's the nosana price right now?\n\nContext: "));
    assert!(content.contains("The price of Nosana is: 1.2345$"));
    assert_eq!(
        rec.price_lookups.lock().unwrap().as_slice(),
        [price.token_address]
    );
}

#[tokio::test]
async fn e2e_price_outage_degrades_to_no_context() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;
    let price = PriceConfig {
        endpoint: format!("{base}/down/defi/price"),
        api_key: Some("be-key".into()),
        ..PriceConfig::default()
    };

    let (status, body) = chat(gateway(&base, "ok", price), ask("price of nosana?")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Hello, world");
    assert_eq!(rec.last_user_content(), "price of nosana?");
}

#[tokio::test]
async fn e2e_resolver_without_key_never_fetches() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;
    let price = PriceConfig {
        endpoint: format!("{base}/defi/price"),
        ..PriceConfig::default()
    };

    let resolver = context_resolver(&price).unwrap();
    let fact = resolver.resolve(Some("nosana price?"), None).await;
    assert_eq!(fact, ContextFact::None);
    assert!(rec.price_lookups.lock().unwrap().is_empty());
}

// ── E2E: Upstream Failures ──────────────────────────────────────────────

async fn failure(route: &str) -> (StatusCode, Value) {
    let rec = Recorded::default();
    let base = fake_provider(rec).await;
    let (status, body) = chat(gateway(&base, route, no_price()), ask("Hi")).await;
    (status, serde_json::from_str(&body).expect("JSON error body"))
}

#[tokio::test]
async fn e2e_unauthorized_is_bad_gateway() {
    let (status, body) = failure("unauthorized").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_auth");
    assert_eq!(body["message"], "Incorrect API key provided");
}

#[tokio::test]
async fn e2e_rate_limited_is_bad_gateway() {
    let (status, body) = failure("limited").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_rate_limit");
    assert_eq!(body["message"], "Rate limit reached for requests");
}

#[tokio::test]
async fn e2e_server_error_is_protocol_failure() {
    let (status, body) = failure("broken").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_protocol");
    assert_eq!(body["message"], "upstream exploded");
}

#[tokio::test]
async fn e2e_unparseable_stream_fails_before_streaming() {
    let (status, body) = failure("garbage").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_protocol");
}

#[tokio::test]
async fn e2e_unreachable_upstream_is_transport_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let app = gateway(&format!("http://{addr}"), "ok", no_price());
    let (status, body) = chat(app, ask("Hi")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["error"], "upstream_transport");
}

async fn silent_failure(route: &str) -> (StatusCode, Value) {
    let base = fake_provider(Recorded::default()).await;
    let mut config = gateway_config(&base, route, no_price());
    config.relay.first_byte_timeout_secs = 1;
    let (status, body) = tokio::time::timeout(
        Duration::from_secs(10),
        chat(router_for(&config), ask("Hi")),
    )
    .await
    .expect("gateway gave up on the silent upstream");
    (status, serde_json::from_str(&body).expect("JSON error body"))
}

#[tokio::test]
async fn e2e_upstream_that_never_answers_is_transport_failure() {
    let (status, body) = silent_failure("silent").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_transport");
}

#[tokio::test]
async fn e2e_upstream_that_never_sends_a_chunk_is_transport_failure() {
    let (status, body) = silent_failure("headers").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_transport");
}

#[tokio::test]
async fn e2e_body_without_line_breaks_is_protocol_failure() {
    let (status, body) = failure("endless").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_protocol");
}

#[tokio::test]
async fn e2e_huge_error_body_is_truncated() {
    let (status, body) = failure("huge-error").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "upstream_protocol");
    let message = body["message"].as_str().unwrap();
    assert!(message.starts_with("eee"));
    assert!(message.len() <= 8 * 1024);
}

// ── E2E: Upstream Client + Relay ────────────────────────────────────────

fn direct_request(base: &str, route: &str) -> UpstreamRequest {
    UpstreamRequest {
        url: format!("{base}/{route}/v1/chat/completions"),
        model: ModelSpec::new("gpt-4", 8192),
        plan: Plan {
            system_prompt: "You are terse.".into(),
            included_messages: vec![Message::user("Hi")],
            prompt_tokens: 0,
        },
        api_key: "sk-test".into(),
        temperature: 1.0,
        max_tokens: 1000,
    }
}

#[tokio::test]
async fn e2e_relay_reports_upstream_failure_after_partial_output() {
    let base = fake_provider(Recorded::default()).await;
    let upstream = OpenAiCompatUpstream::new("fake", Duration::from_secs(5)).unwrap();
    let handle = upstream.open(direct_request(&base, "drop")).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let relay = tokio::spawn(async move { Relay::new().run(handle, tx).await });

    let mut received = Vec::new();
    while let Some(chunk) = rx.recv().await {
        received.push(chunk.text);
    }
    assert_eq!(received, ["one ", "two ", "three"]);

    match relay.await.unwrap() {
        RelayOutcome::UpstreamFailed { kind, chunks, .. } => {
            assert_eq!(kind, ErrorKind::UpstreamTransport);
            assert_eq!(chunks, 3);
        }
        other => panic!("expected upstream failure, got {other:?}"),
    }
}

#[tokio::test]
async fn e2e_relay_stops_when_caller_leaves() {
    let base = fake_provider(Recorded::default()).await;
    let upstream = OpenAiCompatUpstream::new("fake", Duration::from_secs(5)).unwrap();
    let handle = upstream.open(direct_request(&base, "drop")).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let relay = tokio::spawn(async move { Relay::new().run(handle, tx).await });

    assert_eq!(rx.recv().await.unwrap().text, "one ");
    drop(rx);

    let outcome = relay.await.unwrap();
    assert!(matches!(outcome, RelayOutcome::Cancelled { .. }));
}

// ── E2E: Budget Planning ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_long_history_is_trimmed_from_the_oldest_end() {
    let rec = Recorded::default();
    let base = fake_provider(rec.clone()).await;

    let filler = "lorem ipsum dolor sit amet ".repeat(40);
    let mut messages: Vec<Value> = (0..40)
        .map(|i| {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            json!({"role": role, "content": format!("turn {i}: {filler}")})
        })
        .collect();
    messages.push(json!({"role": "user", "content": "latest question"}));

    let body = json!({
        "model": {"id": "gpt-3.5-turbo", "tokenLimit": 4096},
        "messages": messages,
    });
    let (status, _) = chat(gateway(&base, "ok", no_price()), body).await;
    assert_eq!(status, StatusCode::OK);

    let sent = rec.last_body();
    let sent_messages = sent["messages"].as_array().unwrap();
    assert!(sent_messages.len() < 42);
    assert_eq!(sent_messages[0]["role"], "system");
    assert_eq!(sent_messages.last().unwrap()["content"], "latest question");

    // The kept turns are a contiguous suffix of the conversation.
    let first_kept = sent_messages[1]["content"].as_str().unwrap();
    let start = messages
        .iter()
        .position(|m| m["content"] == first_kept)
        .unwrap();
    assert_eq!(sent_messages.len() - 1, messages.len() - start);
}

#[test]
fn e2e_planner_keeps_everything_that_fits() {
    let tokenizer = nosrelay_core::BpeTokenizer::for_model("gpt-4").unwrap();
    let conversation = vec![
        Message::user("Hello"),
        Message::assistant("Hi there"),
        Message::user("How are you?"),
    ];
    let plan = BudgetPlanner::new(&tokenizer)
        .plan(
            &ModelSpec::new("gpt-4", 8192),
            "You are terse.",
            &ContextFact::None,
            &conversation,
        )
        .unwrap();
    assert_eq!(plan.included_messages, conversation);
}

// ── E2E: Configuration System ───────────────────────────────────────────

#[test]
fn e2e_default_config_round_trips_through_toml() {
    let toml_str = AppConfig::default_toml();
    let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
    assert_eq!(parsed.relay.reserved_tokens, 768);
    assert_eq!(parsed.relay.max_completion_tokens, 1000);
    assert_eq!(parsed.gateway.port, 3000);
    assert!(parsed.validate().is_ok());
}
