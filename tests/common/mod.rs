//! Shared wiring for the integration suites

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use papertrade::ledger;
use papertrade::models::WalletKind;
use papertrade::services::futures::{FuturesEngine, FuturesOrderService, PositionCloser};
use papertrade::services::portfolio::PortfolioService;
use papertrade::services::price::{PriceCache, PriceError, PriceSource};
use papertrade::services::spot::{SpotMatchingEngine, SpotOrderService};
use papertrade::store::Store;
use papertrade::ws::AccountEventBroadcaster;

/// Source answering from a fixed table; unknown symbols fail
struct StaticPrices {
    prices: HashMap<String, Decimal>,
}

#[async_trait]
impl PriceSource for StaticPrices {
    async fn fetch_price(&self, symbol: &str) -> Result<Decimal, PriceError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| PriceError::Upstream {
                symbol: symbol.to_string(),
                reason: "no quote".to_string(),
            })
    }
}

/// Cache pre-warmed with the given prices; its source knows them too
pub fn warm_cache(pairs: &[(&str, Decimal)]) -> Arc<PriceCache> {
    let table: HashMap<String, Decimal> = pairs
        .iter()
        .map(|(symbol, price)| (symbol.to_string(), *price))
        .collect();
    let cache = PriceCache::new(
        Arc::new(StaticPrices { prices: table }),
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_millis(200),
    );
    for (symbol, price) in pairs {
        cache.update_price(symbol, *price);
    }
    Arc::new(cache)
}

pub fn quiet_broadcaster(store: &Store) -> Arc<AccountEventBroadcaster> {
    let portfolio = Arc::new(PortfolioService::new(store.clone(), warm_cache(&[])));
    Arc::new(AccountEventBroadcaster::new(
        portfolio,
        Duration::from_secs(3600),
    ))
}

pub async fn fund(store: &Store, user_id: Uuid, wallet: WalletKind, asset: &str, amount: Decimal) {
    let mut tx = store.begin().await;
    ledger::receive(&mut tx, user_id, wallet, asset, amount).unwrap();
    tx.commit();
}

/// The full engine stack around one store, ticked by hand
pub struct Venue {
    pub store: Store,
    pub prices: Arc<PriceCache>,
    pub orders: Arc<FuturesOrderService>,
    pub closer: Arc<PositionCloser>,
    pub engine: FuturesEngine,
    pub spot: SpotOrderService,
    pub matcher: SpotMatchingEngine,
}

pub fn venue(pairs: &[(&str, Decimal)]) -> Venue {
    let store = Store::new();
    let prices = warm_cache(pairs);
    let broadcaster = quiet_broadcaster(&store);

    let orders = Arc::new(FuturesOrderService::new(
        store.clone(),
        prices.clone(),
        broadcaster.clone(),
    ));
    let closer = Arc::new(PositionCloser::new(
        store.clone(),
        prices.clone(),
        broadcaster.clone(),
    ));
    let engine = FuturesEngine::new(
        store.clone(),
        prices.clone(),
        orders.clone(),
        closer.clone(),
        Duration::from_secs(3600),
    );
    let spot = SpotOrderService::new(store.clone(), prices.clone(), broadcaster.clone());
    let matcher = SpotMatchingEngine::new(store.clone(), broadcaster);

    Venue {
        store,
        prices,
        orders,
        closer,
        engine,
        spot,
        matcher,
    }
}
