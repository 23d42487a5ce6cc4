//! Portfolio valuation
//!
//! Collapses a user's spot holdings, futures wallet and open positions into
//! one USD figure. Valuation never fails outright: an asset whose price
//! cannot be resolved simply contributes its safe floor (zero for spot
//! holdings, margin alone for positions).

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::models::{is_stable, WalletKind};
use crate::services::price::PriceCache;
use crate::store::Store;

pub struct PortfolioService {
    store: Store,
    prices: Arc<PriceCache>,
}

impl PortfolioService {
    pub fn new(store: Store, prices: Arc<PriceCache>) -> Self {
        Self { store, prices }
    }

    /// Total account value in USD, rounded to cents
    ///
    /// Spot and futures balances count available + reserved. Each open
    /// position contributes `margin + unrealized PnL` at the current mark,
    /// or margin alone when no mark is available.
    pub async fn total_portfolio_usd(&self, user_id: Uuid) -> Decimal {
        let mut total = Decimal::ZERO;

        for record in self.store.balances_for(user_id, WalletKind::Spot).await {
            let quantity = record.total();
            if quantity == Decimal::ZERO {
                continue;
            }
            if is_stable(&record.asset) {
                total += quantity;
                continue;
            }
            match self.prices.get_price(&format!("{}USDT", record.asset)).await {
                Ok(price) => total += quantity * price,
                Err(err) => {
                    debug!(asset = %record.asset, error = %err, "spot asset skipped in valuation");
                }
            }
        }

        for record in self.store.balances_for(user_id, WalletKind::Futures).await {
            total += record.total();
        }

        for position in self.store.positions_for(user_id).await {
            match self.prices.get_price(&position.symbol).await {
                Ok(mark) => total += position.margin + position.unrealized_pnl(mark),
                Err(err) => {
                    debug!(symbol = %position.symbol, error = %err, "position valued at margin only");
                    total += position.margin;
                }
            }
        }

        total.round_dp(2)
    }
}
