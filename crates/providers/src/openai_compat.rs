//! OpenAI-compatible streaming upstream.
//!
//! Works with: OpenAI, Azure-style proxies, OpenRouter, Ollama, vLLM and any
//! endpoint that speaks the `/v1/chat/completions` SSE protocol.
//!
//! The upstream is opened once per request and never retried here. The
//! response body is read lazily: a chunk is only pulled off the socket when
//! the relay asks for the next one.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use nosrelay_config::RelayConfig;
use nosrelay_core::error::{Error, Result};
use nosrelay_core::message::Role;
use nosrelay_core::upstream::{StreamChunk, StreamHandle, Upstream, UpstreamRequest};

use crate::sse::{ApiErrorBody, SseDecoder, StreamEvent, parse_event};

/// An OpenAI-compatible streaming completion client.
pub struct OpenAiCompatUpstream {
    name: String,
    client: reqwest::Client,
}

impl OpenAiCompatUpstream {
    /// Create a client. Only connecting is bounded; streams may run long.
    pub fn new(name: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            client,
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Self::new(
            "openai",
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    /// Build the JSON body: system prompt first, then the planned turns.
    fn request_body(request: &UpstreamRequest) -> ApiRequest<'_> {
        let mut messages = Vec::with_capacity(request.plan.included_messages.len() + 1);
        messages.push(ApiMessage {
            role: Role::System.as_str(),
            content: &request.plan.system_prompt,
        });
        messages.extend(request.plan.included_messages.iter().map(|m| ApiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        ApiRequest {
            model: &request.model.id,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
        }
    }
}

/// Most of an error body kept for the classified message.
const MAX_ERROR_BODY_BYTES: usize = 8 * 1024;

/// Read at most `limit` bytes of a body; read errors end the read.
async fn read_capped(response: reqwest::Response, limit: usize) -> String {
    let mut body = Vec::new();
    let mut stream = Box::pin(response.bytes_stream());
    while let Some(Ok(bytes)) = stream.next().await {
        let room = limit - body.len();
        body.extend_from_slice(&bytes[..bytes.len().min(room)]);
        if body.len() >= limit {
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Map a non-2xx status to the error taxonomy.
fn classify_status(status: u16, message: String) -> Error {
    match status {
        401 | 403 => Error::UpstreamAuth { status, message },
        429 => Error::UpstreamRateLimit { status, message },
        _ => Error::UpstreamProtocol {
            status: Some(status),
            message,
        },
    }
}

/// Prefer the provider's own `error.message`, then the raw body, then the
/// status text.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        if !parsed.error.message.is_empty() {
            return parsed.error.message;
        }
    }
    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }
    status.canonical_reason().unwrap_or_default().to_string()
}

#[async_trait]
impl Upstream for OpenAiCompatUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, request: UpstreamRequest) -> Result<StreamHandle> {
        let body = Self::request_body(&request);

        debug!(
            upstream = %self.name,
            model = %request.model.id,
            messages = body.messages.len(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&request.url)
            .bearer_auth(&request.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = read_capped(response, MAX_ERROR_BODY_BYTES).await;
            let message = error_message(status, &error_body);
            warn!(status = status.as_u16(), message = %message, "Upstream returned error");
            return Err(classify_status(status.as_u16(), message));
        }

        // Read up to the first piece of text so an unreadable response still
        // fails before the caller has seen any bytes.
        let mut reader = ChunkReader::new(Box::pin(response.bytes_stream()));
        let first = match reader.next_chunk().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => {
                warn!(upstream = %self.name, error = %e, "Upstream stream unusable");
                return Err(e);
            }
            None if !reader.saw_event => {
                warn!(upstream = %self.name, "Upstream response carried no stream events");
                return Err(Error::protocol("response contained no stream events"));
            }
            None => None,
        };

        info!(upstream = %self.name, model = %request.model.id, "Upstream stream opened");

        let rest = futures::stream::unfold(reader, |mut reader| async move {
            let item = reader.next_chunk().await?;
            Some((item, reader))
        });
        Ok(StreamHandle::new(
            futures::stream::iter(first.map(Ok)).chain(rest),
        ))
    }
}

/// Turns a raw body stream into text chunks.
struct ChunkReader<S> {
    body: S,
    decoder: SseDecoder,
    finished: bool,
    saw_event: bool,
}

impl<S, B, E> ChunkReader<S>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin + Send,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    fn new(body: S) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            finished: false,
            saw_event: false,
        }
    }

    /// The next non-empty text delta; `None` once the stream has ended or
    /// failed.
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(data) = self.decoder.next_data() {
                self.saw_event = true;
                match self.handle_data(&data) {
                    Some(item) => return Some(item),
                    None => continue,
                }
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    if let Err(e) = self.decoder.push(bytes.as_ref()) {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(Error::UpstreamTransport(e.to_string())));
                }
                None => {
                    // Ended without [DONE]; honour a final unterminated line.
                    let item = self.decoder.finish().and_then(|data| {
                        self.saw_event = true;
                        self.handle_data(&data)
                    });
                    self.finished = true;
                    return item;
                }
            }
        }
    }

    fn handle_data(&mut self, data: &str) -> Option<Result<StreamChunk>> {
        match parse_event(data) {
            Ok(StreamEvent::Done) => {
                self.finished = true;
                None
            }
            Ok(StreamEvent::Delta(Some(text))) if !text.is_empty() => {
                Some(Ok(StreamChunk::new(text)))
            }
            Ok(StreamEvent::Delta(_)) => {
                trace!("Skipping empty delta");
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}
