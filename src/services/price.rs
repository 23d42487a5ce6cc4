//! Price source and cache
//!
//! Mark prices come from an upstream ticker endpoint behind the
//! [`PriceSource`] trait. The [`PriceCache`] in front of it serves reads
//! from a freshness window, refreshes on demand, and degrades to a bounded
//! stale window when the upstream is down, so one flaky poll cannot stall
//! a whole scheduler pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PriceError {
    #[error("Upstream price error for {symbol}: {reason}")]
    Upstream { symbol: String, reason: String },

    #[error("Invalid price for {symbol}: {raw}")]
    InvalidPrice { symbol: String, raw: String },

    #[error("Price fetch timed out for {0}")]
    Timeout(String),
}

/// Anything that can produce a current price for a symbol
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, PriceError>;
}

// ============================================================================
// HTTP source
// ============================================================================

#[derive(Deserialize)]
struct TickerPayload {
    price: String,
}

/// Production source backed by the exchange ticker endpoint
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, PriceError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url.trim_end_matches('/'),
            symbol
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PriceError::Upstream {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PriceError::Upstream {
                symbol: symbol.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        let ticker: TickerPayload =
            response.json().await.map_err(|e| PriceError::Upstream {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        let price: Decimal = ticker.price.parse().map_err(|_| PriceError::InvalidPrice {
            symbol: symbol.to_string(),
            raw: ticker.price.clone(),
        })?;
        if price <= Decimal::ZERO {
            return Err(PriceError::InvalidPrice {
                symbol: symbol.to_string(),
                raw: ticker.price,
            });
        }
        Ok(price)
    }
}

// ============================================================================
// Cache
// ============================================================================

struct CachedPrice {
    price: Decimal,
    stored_at: Instant,
}

/// Freshness-windowed price cache over a [`PriceSource`]
///
/// Reads inside the fresh window are served from memory. A stale read
/// triggers a refresh (bounded by `fetch_timeout`); if the refresh fails,
/// a cached price younger than the fallback window is served instead and
/// the failure only propagates once the cache is too old to trust.
pub struct PriceCache {
    prices: DashMap<String, CachedPrice>,
    source: Arc<dyn PriceSource>,
    fresh_window: Duration,
    fallback_window: Duration,
    fetch_timeout: Duration,
}

impl PriceCache {
    pub fn new(
        source: Arc<dyn PriceSource>,
        fresh_window: Duration,
        fallback_window: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            prices: DashMap::new(),
            source,
            fresh_window,
            fallback_window,
            fetch_timeout,
        }
    }

    /// Push a price observed elsewhere (feed loops) into the cache
    pub fn update_price(&self, symbol: &str, price: Decimal) {
        let key = symbol.to_uppercase();
        self.prices.insert(
            key,
            CachedPrice {
                price,
                stored_at: Instant::now(),
            },
        );
    }

    /// Current price for `symbol`, refreshing from the source when stale
    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, PriceError> {
        let key = symbol.to_uppercase();
        let cached = self
            .prices
            .get(&key)
            .map(|entry| (entry.price, entry.stored_at.elapsed()));

        if let Some((price, age)) = cached {
            if age < self.fresh_window {
                return Ok(price);
            }
        }

        let refresh_err =
            match tokio::time::timeout(self.fetch_timeout, self.source.fetch_price(&key)).await {
                Ok(Ok(price)) => {
                    debug!(symbol = %key, %price, "price refreshed from source");
                    self.update_price(&key, price);
                    return Ok(price);
                }
                Ok(Err(err)) => err,
                Err(_) => PriceError::Timeout(key.clone()),
            };

        // Refresh failed. A price past its fresh window but inside the
        // fallback window still beats no price at all.
        if let Some((price, age)) = cached {
            if age < self.fallback_window {
                warn!(symbol = %key, %price, error = %refresh_err, "serving stale price after refresh failure");
                return Ok(price);
            }
        }
        Err(refresh_err)
    }

    /// Snapshot of every cached price, regardless of age
    pub fn all_prices(&self) -> HashMap<String, Decimal> {
        self.prices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().price))
            .collect()
    }
}
