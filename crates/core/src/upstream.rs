//! Upstream trait: the abstraction over the streaming LLM endpoint.
//!
//! An `Upstream` opens one long-lived completion request and exposes the
//! answer as a lazy sequence of [`StreamChunk`]s. Implementations classify
//! their own failures into the relay error taxonomy and never retry.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::ModelSpec;
use crate::planner::Plan;

/// Default completion length requested from the upstream.
pub const DEFAULT_MAX_COMPLETION_TOKENS: u32 = 1000;

/// One streaming completion request.
#[derive(Clone)]
pub struct UpstreamRequest {
    /// Full completion endpoint URL
    pub url: String,

    pub model: ModelSpec,

    pub plan: Plan,

    /// Bearer credential for the upstream
    pub api_key: String,

    pub temperature: f32,

    pub max_tokens: u32,
}

impl std::fmt::Debug for UpstreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRequest")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("plan", &self.plan)
            .field("api_key", &"[REDACTED]")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// An ordered unit of text delivered by the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
}

impl StreamChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A lazy, finite, non-restartable sequence of chunks.
///
/// Dropping the handle drops the underlying connection.
pub struct StreamHandle {
    inner: ChunkStream,
}

impl StreamHandle {
    pub fn new(stream: impl Stream<Item = Result<StreamChunk>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Pull the next chunk; `None` is a graceful end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

impl Stream for StreamHandle {
    type Item = Result<StreamChunk>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A streaming completion backend.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// A human-readable name for this upstream (e.g., "openai").
    fn name(&self) -> &str;

    /// Open the stream. Fails fast with a classified error.
    async fn open(&self, request: UpstreamRequest) -> Result<StreamHandle>;
}
