//! Stream relay.
//!
//! Pulls chunks from an upstream [`StreamHandle`] and forwards each one to the
//! caller's sink as soon as it is decoded. A sink slot is reserved before the
//! next upstream chunk is requested, so the relay never holds more than the
//! sink's capacity in memory and never reads ahead of a slow caller.
//!
//! The sink is owned by the relay and dropped when [`Relay::run`] returns,
//! which closes the caller's output exactly once on every path.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::upstream::{StreamChunk, StreamHandle};

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RelayOutcome {
    /// The upstream finished gracefully.
    Completed { chunks: usize, bytes: usize },
    /// The upstream failed mid-stream; forwarded output stays valid.
    UpstreamFailed {
        kind: ErrorKind,
        chunks: usize,
        bytes: usize,
    },
    /// The caller went away.
    Cancelled { chunks: usize, bytes: usize },
    /// The caller's deadline elapsed.
    TimedOut { chunks: usize, bytes: usize },
}

impl RelayOutcome {
    pub fn chunks(&self) -> usize {
        match *self {
            RelayOutcome::Completed { chunks, .. }
            | RelayOutcome::UpstreamFailed { chunks, .. }
            | RelayOutcome::Cancelled { chunks, .. }
            | RelayOutcome::TimedOut { chunks, .. } => chunks,
        }
    }
}

/// Forwards upstream chunks to a caller sink.
#[derive(Debug, Clone, Default)]
pub struct Relay {
    timeout: Option<Duration>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop relaying once `timeout` has elapsed since [`Relay::run`] started.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Relay until the upstream ends, fails, the caller disconnects or the
    /// deadline passes.
    pub async fn run(
        &self,
        mut handle: StreamHandle,
        sink: mpsc::Sender<StreamChunk>,
    ) -> RelayOutcome {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut chunks = 0;
        let mut bytes = 0;

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                _ = &mut expired => break RelayOutcome::TimedOut { chunks, bytes },
                reserved = sink.reserve() => match reserved {
                    Ok(permit) => permit,
                    Err(_) => break RelayOutcome::Cancelled { chunks, bytes },
                },
            };

            let next = tokio::select! {
                biased;
                _ = sink.closed() => break RelayOutcome::Cancelled { chunks, bytes },
                _ = &mut expired => break RelayOutcome::TimedOut { chunks, bytes },
                next = handle.next_chunk() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    bytes += chunk.len();
                    permit.send(chunk);
                }
                Some(Err(e)) => {
                    warn!(error = %e, chunks, "Upstream failed mid-stream, ending response");
                    break RelayOutcome::UpstreamFailed {
                        kind: e.kind(),
                        chunks,
                        bytes,
                    };
                }
                None => break RelayOutcome::Completed { chunks, bytes },
            }
        };

        // Release the upstream connection before the caller's stream ends.
        drop(handle);
        drop(sink);
        debug!(?outcome, "Relay finished");
        outcome
    }
}
