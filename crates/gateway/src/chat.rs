//! `POST /api/chat`: assemble the prompt and stream the answer as plain text.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Json, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use nosrelay_config::RelayConfig;
use nosrelay_core::message::latest_user_content;
use nosrelay_core::{
    BpeTokenizer, BudgetPlanner, Error, Message, ModelSpec, Relay, RelayOutcome, Result,
    StreamHandle, UpstreamRequest,
};

use crate::{RelayState, SharedState};
use crate::error::ApiError;

/// Body of a chat request.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Completion endpoint; empty uses the configured default.
    #[serde(default)]
    pub url: String,

    pub model: ModelSpec,

    #[serde(default)]
    pub messages: Vec<Message>,

    /// Upstream credential; empty uses the configured key.
    #[serde(default)]
    pub key: String,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub search_results: Option<Vec<String>>,
}

pub(crate) async fn chat_handler(
    State(state): State<SharedState>,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id, model = %request.model.id);
    info!(parent: &span, messages = request.messages.len(), "Chat request");

    let handle = open_stream(&state, request)
        .instrument(span.clone())
        .await?;

    let (tx, rx) = mpsc::channel(state.relay.stream_buffer.max(1));
    let relay = Relay::new().with_timeout(stream_timeout(&state.relay));
    tokio::spawn(
        async move {
            let outcome = relay.run(handle, tx).await;
            match outcome {
                RelayOutcome::UpstreamFailed { kind, chunks, .. } => {
                    warn!(%kind, chunks, "Stream ended early")
                }
                _ => info!(?outcome, "Stream finished"),
            }
        }
        .instrument(span),
    );

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk.text))),
    );
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Resolve context, plan the prompt and open the upstream stream.
///
/// Everything that can fail with a status code happens here, before the
/// first byte of the answer is committed.
pub async fn open_stream(state: &RelayState, request: ChatRequest) -> Result<StreamHandle> {
    let config = &state.relay;
    let ChatRequest {
        url,
        model,
        messages,
        key,
        temperature,
        search_results,
    } = request;

    let tokenizer = BpeTokenizer::for_model(&model.id)?;

    let context = state
        .resolver
        .resolve(latest_user_content(&messages), search_results)
        .await;
    debug!(context = context.label(), "Context resolved");

    let plan = BudgetPlanner::new(&tokenizer)
        .with_reserved_tokens(config.reserved_tokens)
        .plan(&model, &config.system_prompt, &context, &messages)?;

    let request = UpstreamRequest {
        url: if url.is_empty() {
            config.default_upstream_url.clone()
        } else {
            url
        },
        model,
        plan,
        api_key: if key.is_empty() {
            config.api_key.clone().unwrap_or_default()
        } else {
            key
        },
        temperature: temperature.unwrap_or(config.default_temperature),
        max_tokens: config.max_completion_tokens,
    };
    let deadline = open_timeout(config);
    tokio::time::timeout(deadline, state.upstream.open(request))
        .await
        .map_err(|_| {
            Error::UpstreamTransport(format!("no response from upstream within {deadline:?}"))
        })?
}

/// Deadline for the upstream to answer and send its first chunk. Never
/// longer than the whole-stream deadline.
fn open_timeout(config: &RelayConfig) -> Duration {
    let first_byte = Duration::from_secs(config.first_byte_timeout_secs);
    match stream_timeout(config) {
        Some(stream) => first_byte.min(stream),
        None => first_byte,
    }
}

fn stream_timeout(config: &RelayConfig) -> Option<Duration> {
    (config.stream_timeout_secs > 0).then(|| Duration::from_secs(config.stream_timeout_secs))
}
