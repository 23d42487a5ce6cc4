//! Market data feed
//!
//! One poll loop per tracked symbol: fetch the upstream price, push it
//! into the cache, and on every observed change hand the symbol to the
//! spot matching engine so resting limit orders get swept. Fetch failures
//! are logged and the next poll retries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::services::price::{PriceCache, PriceSource};
use crate::services::spot::SpotMatchingEngine;

#[derive(Clone)]
pub struct MarketFeed {
    source: Arc<dyn PriceSource>,
    prices: Arc<PriceCache>,
    matcher: Arc<SpotMatchingEngine>,
    poll_interval: Duration,
    runner: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl MarketFeed {
    pub fn new(
        source: Arc<dyn PriceSource>,
        prices: Arc<PriceCache>,
        matcher: Arc<SpotMatchingEngine>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            prices,
            matcher,
            poll_interval,
            runner: Arc::new(Mutex::new(None)),
        }
    }

    fn runner(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn one poll loop per symbol. A second call while running is a
    /// no-op; stop first to change the symbol set.
    pub fn start(&self, symbols: &[String]) {
        let mut runner = self.runner();
        if runner.is_some() {
            debug!("market feed already running");
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        for symbol in symbols {
            let feed = self.clone();
            let symbol = symbol.clone();
            let stop = stop_rx.clone();
            tokio::spawn(async move {
                feed.poll_symbol(symbol, stop).await;
            });
        }
        *runner = Some(stop_tx);
        info!(symbols = symbols.len(), "market feed started");
    }

    pub fn stop(&self) {
        if let Some(stop) = self.runner().take() {
            let _ = stop.send(true);
            info!("market feed stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner().is_some()
    }

    async fn poll_symbol(&self, symbol: String, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        let mut last_seen: Option<Decimal> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }
            let price = match self.source.fetch_price(&symbol).await {
                Ok(price) => price,
                Err(err) => {
                    debug!(%symbol, error = %err, "price poll failed");
                    continue;
                }
            };
            self.prices.update_price(&symbol, price);
            if last_seen == Some(price) {
                continue;
            }
            last_seen = Some(price);
            if let Err(err) = self.matcher.match_limit_orders(&symbol, price).await {
                warn!(%symbol, error = %err, "limit sweep failed");
            }
        }
        debug!(%symbol, "price poll loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType, SpotSide, WalletKind};
    use crate::services::portfolio::PortfolioService;
    use crate::services::price::PriceError;
    use crate::services::spot::SpotOrderService;
    use crate::services::support::{empty_cache, fund, warm_cache};
    use crate::store::Store;
    use crate::ws::AccountEventBroadcaster;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use uuid::Uuid;

    /// Plays back a fixed price sequence, repeating the last entry
    struct ScriptedFeed {
        prices: std::sync::Mutex<VecDeque<Decimal>>,
    }

    impl ScriptedFeed {
        fn new(prices: &[Decimal]) -> Arc<Self> {
            Arc::new(Self {
                prices: std::sync::Mutex::new(prices.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedFeed {
        async fn fetch_price(&self, _symbol: &str) -> Result<Decimal, PriceError> {
            let mut prices = self.prices.lock().unwrap();
            if prices.len() > 1 {
                Ok(prices.pop_front().unwrap())
            } else {
                Ok(prices[0])
            }
        }
    }

    fn quiet_broadcaster(store: &Store) -> Arc<AccountEventBroadcaster> {
        let portfolio = Arc::new(PortfolioService::new(store.clone(), empty_cache()));
        Arc::new(AccountEventBroadcaster::new(
            portfolio,
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn test_price_drop_sweeps_resting_orders() {
        let store = Store::new();
        let user = Uuid::new_v4();
        fund(&store, user, WalletKind::Spot, "USDT", dec!(1000)).await;

        let broadcaster = quiet_broadcaster(&store);
        let prices = warm_cache(&[("BTCUSDT", dec!(50000))]);
        let spot = SpotOrderService::new(store.clone(), prices.clone(), broadcaster.clone());
        let order = spot
            .place_order(
                user,
                "BTCUSDT",
                SpotSide::Buy,
                OrderType::Limit,
                dec!(0.01),
                Some(dec!(49000)),
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let matcher = Arc::new(SpotMatchingEngine::new(store.clone(), broadcaster));
        let source = ScriptedFeed::new(&[dec!(50000), dec!(48500)]);
        let feed = MarketFeed::new(
            source,
            prices.clone(),
            matcher,
            Duration::from_millis(10),
        );
        feed.start(&["BTCUSDT".to_string()]);

        // the second observed price crosses the limit
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if store.spot_order(order.id).await.unwrap().status == OrderStatus::Filled {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "order should fill once the feed sees 48500"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        feed.stop();
        assert!(!feed.is_running());

        // the cache follows the feed
        assert_eq!(prices.all_prices().get("BTCUSDT"), Some(&dec!(48500)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let store = Store::new();
        let broadcaster = quiet_broadcaster(&store);
        let matcher = Arc::new(SpotMatchingEngine::new(store.clone(), broadcaster));
        let feed = MarketFeed::new(
            ScriptedFeed::new(&[dec!(1)]),
            empty_cache(),
            matcher,
            Duration::from_secs(3600),
        );

        feed.start(&["BTCUSDT".to_string()]);
        feed.start(&["ETHUSDT".to_string()]); // ignored while running
        assert!(feed.is_running());
        feed.stop();
        assert!(!feed.is_running());
    }
}
