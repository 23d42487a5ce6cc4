//! Shared fixtures for service tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::ledger;
use crate::models::{Position, PositionSide, WalletKind};
use crate::services::price::{PriceCache, PriceError, PriceSource};
use crate::store::Store;

/// Source answering from a fixed table; unknown symbols fail
pub(crate) struct StaticPrices {
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
pub(crate) fn warm_cache(pairs: &[(&str, Decimal)]) -> Arc<PriceCache> {
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

/// Cache whose every lookup fails
pub(crate) fn empty_cache() -> Arc<PriceCache> {
    warm_cache(&[])
}

pub(crate) async fn fund(
    store: &Store,
    user_id: Uuid,
    wallet: WalletKind,
    asset: &str,
    amount: Decimal,
) {
    let mut tx = store.begin().await;
    ledger::receive(&mut tx, user_id, wallet, asset, amount).unwrap();
    tx.commit();
}

/// Long 0.02 BTC from 50000 at 10x, margin 100
pub(crate) fn position_fixture(user_id: Uuid, symbol: &str) -> Position {
    Position {
        id: Uuid::new_v4(),
        user_id,
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        quantity: dec!(0.02),
        entry_price: dec!(50000),
        leverage: 10,
        margin: dec!(100),
        liquidation_price: dec!(45500),
        tp_price: Decimal::ZERO,
        tp_quantity: Decimal::ZERO,
        sl_price: Decimal::ZERO,
        sl_quantity: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
