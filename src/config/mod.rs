use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    // Upstream ticker endpoint, Binance-compatible
    #[serde(default = "default_ticker_base_url")]
    pub ticker_base_url: String,

    // Tracked trading pairs (comma-separated string, e.g., "BTCUSDT,ETHUSDT,SOLUSDT")
    #[serde(default = "default_trading_pairs")]
    pub trading_pairs: String,

    // Futures engine settings
    #[serde(default = "default_engine_tick_ms")]
    pub engine_tick_ms: u64,

    // Market feed settings
    #[serde(default = "default_feed_poll_ms")]
    pub feed_poll_ms: u64,

    // Portfolio broadcast settings
    #[serde(default = "default_portfolio_broadcast_ms")]
    pub portfolio_broadcast_ms: u64,

    // Price cache settings
    #[serde(default = "default_price_fresh_ms")]
    pub price_fresh_ms: u64,

    #[serde(default = "default_price_fallback_ms")]
    pub price_fallback_ms: u64,

    #[serde(default = "default_price_fetch_timeout_ms")]
    pub price_fetch_timeout_ms: u64,
}

fn default_ticker_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_trading_pairs() -> String {
    "BTCUSDT,ETHUSDT,SOLUSDT".to_string()
}

fn default_engine_tick_ms() -> u64 {
    2000
}

fn default_feed_poll_ms() -> u64 {
    1000
}

fn default_portfolio_broadcast_ms() -> u64 {
    2000
}

fn default_price_fresh_ms() -> u64 {
    1000 // served from cache without an upstream hit inside this window
}

fn default_price_fallback_ms() -> u64 {
    2000 // stale entries younger than this still serve when upstream fails
}

fn default_price_fetch_timeout_ms() -> u64 {
    1500
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        Ok(app_config)
    }

    /// Get tracked trading pairs as a vector
    pub fn get_trading_pairs(&self) -> Vec<String> {
        self.trading_pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn engine_tick(&self) -> Duration {
        Duration::from_millis(self.engine_tick_ms)
    }

    pub fn feed_poll(&self) -> Duration {
        Duration::from_millis(self.feed_poll_ms)
    }

    pub fn portfolio_broadcast(&self) -> Duration {
        Duration::from_millis(self.portfolio_broadcast_ms)
    }

    pub fn price_fresh(&self) -> Duration {
        Duration::from_millis(self.price_fresh_ms)
    }

    pub fn price_fallback(&self) -> Duration {
        Duration::from_millis(self.price_fallback_ms)
    }

    pub fn price_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.price_fetch_timeout_ms)
    }
}
