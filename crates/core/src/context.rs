//! Context resolution.
//!
//! Decides which external context accompanies the newest user turn: a live
//! token price, the caller-supplied semantic-search documents, or nothing.
//! Exactly one [`ContextFact`] is produced per request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Phrases that signal a price question (matched against lowercased text).
pub const DEFAULT_PRICE_TRIGGERS: [&str; 2] = ["nosana price", "price of nosana"];

/// Default bound on the outbound price fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The context injected into the newest user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextFact {
    /// A real-time price, in USD.
    Price(f64),
    /// Externally computed semantic-search documents, best match first.
    SearchResults(Vec<String>),
    None,
}

impl ContextFact {
    /// Append this context to `content`.
    pub fn render_onto(&self, content: &str) -> String {
        match self {
            ContextFact::Price(value) => format!(
                "{content}\n\nContext: The current price of Nosana is ${value:.4}. \
                 Respond with just the price, prefaced by \"The price of Nosana is: {value:.4}$\"."
            ),
            ContextFact::SearchResults(documents) => {
                format!("{content}\n\nContext:\n{}", documents.join("\n\n"))
            }
            ContextFact::None => content.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ContextFact::Price(_) => "price",
            ContextFact::SearchResults(_) => "search_results",
            ContextFact::None => "none",
        }
    }
}

/// A source of the live token price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// A human-readable name for this source (e.g., "birdeye").
    fn name(&self) -> &str;

    /// Fetch the current price. Any failure is `ContextFetchFailed`.
    async fn fetch_price(&self) -> Result<f64>;
}

/// Chooses and packages the context for one request.
#[derive(Clone)]
pub struct ContextResolver {
    price_source: Option<Arc<dyn PriceSource>>,
    triggers: Vec<String>,
    fetch_timeout: Duration,
}

impl ContextResolver {
    pub fn new(price_source: Arc<dyn PriceSource>) -> Self {
        Self {
            price_source: Some(price_source),
            triggers: DEFAULT_PRICE_TRIGGERS.iter().map(|t| t.to_string()).collect(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// A resolver that never fetches; price questions get no context.
    pub fn without_price() -> Self {
        Self {
            price_source: None,
            triggers: DEFAULT_PRICE_TRIGGERS.iter().map(|t| t.to_string()).collect(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Replace the trigger phrases. Blank phrases are ignored; they would
    /// match every message.
    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.triggers = triggers
            .into_iter()
            .map(|t| t.into().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Whether `message` asks for the price.
    pub fn wants_price(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.triggers.iter().any(|t| lowered.contains(t.as_str()))
    }

    /// Resolve the context for the newest user message.
    ///
    /// The price branch wins over search results. A failed or malformed
    /// price fetch degrades to `ContextFact::None`; it never fails the request.
    pub async fn resolve(
        &self,
        latest_user_message: Option<&str>,
        search_results: Option<Vec<String>>,
    ) -> ContextFact {
        let Some(message) = latest_user_message else {
            return ContextFact::None;
        };

        if self.wants_price(message) {
            return match self.fetch_price().await {
                Ok(value) => ContextFact::Price(value),
                Err(e) => {
                    warn!(error = %e, "Price unavailable, continuing without context");
                    ContextFact::None
                }
            };
        }

        match search_results {
            Some(documents) if !documents.is_empty() => {
                debug!(documents = documents.len(), "Using caller-supplied search results");
                ContextFact::SearchResults(documents)
            }
            _ => ContextFact::None,
        }
    }

    async fn fetch_price(&self) -> Result<f64> {
        let source = self
            .price_source
            .as_ref()
            .ok_or_else(|| Error::ContextFetchFailed("no price source configured".into()))?;

        let value = tokio::time::timeout(self.fetch_timeout, source.fetch_price())
            .await
            .map_err(|_| {
                Error::ContextFetchFailed(format!(
                    "{} did not answer within {:?}",
                    source.name(),
                    self.fetch_timeout
                ))
            })??;

        if !value.is_finite() || value <= 0.0 {
            return Err(Error::ContextFetchFailed(format!(
                "{} returned an unusable price: {value}",
                source.name()
            )));
        }

        info!(source = %source.name(), price = value, "Fetched price");
        Ok(value)
    }
}
