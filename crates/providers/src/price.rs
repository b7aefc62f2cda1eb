//! Birdeye price source.
//!
//! A single GET per price question, bounded by a timeout. Every failure is
//! reported as `ContextFetchFailed`; the resolver degrades it to no context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use nosrelay_config::PriceConfig;
use nosrelay_core::context::{ContextResolver, PriceSource};
use nosrelay_core::error::{Error, Result};

pub struct BirdeyePriceSource {
    client: reqwest::Client,
    endpoint: String,
    token_address: String,
    api_key: String,
}

impl BirdeyePriceSource {
    pub fn new(
        endpoint: impl Into<String>,
        token_address: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token_address: token_address.into(),
            api_key: api_key.into(),
        })
    }

    /// `None` when the price branch is disabled or has no credential.
    pub fn from_config(config: &PriceConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(api_key) = config.api_key.as_deref() else {
            return Ok(None);
        };
        Self::new(
            &config.endpoint,
            &config.token_address,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }
}

#[async_trait]
impl PriceSource for BirdeyePriceSource {
    fn name(&self) -> &str {
        "birdeye"
    }

    async fn fetch_price(&self) -> Result<f64> {
        debug!(endpoint = %self.endpoint, "Fetching price");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("address", self.token_address.as_str())])
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::ContextFetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ContextFetchFailed(format!(
                "price endpoint returned {status}"
            )));
        }

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| Error::ContextFetchFailed(format!("malformed price response: {e}")))?;

        Ok(body.data.value)
    }
}

/// Build the resolver described by `[price]`.
pub fn context_resolver(config: &PriceConfig) -> Result<ContextResolver> {
    let resolver = match BirdeyePriceSource::from_config(config)? {
        Some(source) => ContextResolver::new(Arc::new(source)),
        None => {
            debug!("Price source disabled; price questions get no context");
            ContextResolver::without_price()
        }
    };

    Ok(resolver
        .with_triggers(config.trigger_phrases.iter().cloned())
        .with_fetch_timeout(Duration::from_secs(config.timeout_secs)))
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    data: PriceData,
}

#[derive(Debug, Deserialize)]
struct PriceData {
    value: f64,
}
