//! Network-facing implementations of the nosrelay core traits.
//!
//! - [`OpenAiCompatUpstream`] implements `nosrelay_core::Upstream`
//! - [`BirdeyePriceSource`] implements `nosrelay_core::PriceSource`

pub mod openai_compat;
pub mod price;
pub mod sse;

pub use openai_compat::OpenAiCompatUpstream;
pub use price::{BirdeyePriceSource, context_resolver};
