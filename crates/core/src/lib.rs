//! # Nosrelay Core
//!
//! The request-assembly and streaming-relay pipeline that sits between a chat
//! client and a hosted LLM:
//!
//! caller request → [`ContextResolver`] → [`BudgetPlanner`] → [`Upstream`]
//! → [`Relay`], with every failure expressed as an [`Error`] and turned into a
//! caller-visible outcome by [`Error::classify`].
//!
//! This crate has no HTTP framework dependencies. The reqwest-backed
//! upstream and price source live in `nosrelay-providers`; the axum service
//! lives in `nosrelay-gateway`.

pub mod context;
pub mod error;
pub mod message;
pub mod planner;
pub mod relay;
pub mod tokenizer;
pub mod upstream;

// Re-export key types at crate root for ergonomics
pub use context::{ContextFact, ContextResolver, PriceSource};
pub use error::{Classification, Error, ErrorKind, Result};
pub use message::{Message, ModelSpec, Role};
pub use planner::{BudgetPlanner, Plan};
pub use relay::{Relay, RelayOutcome};
pub use tokenizer::{BpeTokenizer, Tokenizer};
pub use upstream::{StreamChunk, StreamHandle, Upstream, UpstreamRequest};
