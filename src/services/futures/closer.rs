//! Position close and liquidation paths
//!
//! Every way a position shrinks or disappears funnels through
//! [`PositionCloser`]: manual closes, TP/SL triggers and liquidations.
//! Each close is one transaction that settles the refund, writes the
//! history row and removes or shrinks the position together.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::ledger;
use crate::models::{Position, PositionHistory, SymbolPair, WalletKind};
use crate::services::price::PriceCache;
use crate::store::Store;
use crate::ws::{AccountEvent, AccountEventBroadcaster};

use super::FuturesError;

/// What a close settled
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub position_id: Uuid,
    pub symbol: String,
    pub closed_quantity: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub margin_released: Decimal,

    /// Margin plus PnL actually returned to the wallet, floored at zero
    pub refund: Decimal,

    /// The shrunk position after a partial close, `None` when fully closed
    pub remaining: Option<Position>,
}

pub struct PositionCloser {
    store: Store,
    prices: Arc<PriceCache>,
    broadcaster: Arc<AccountEventBroadcaster>,
}

impl PositionCloser {
    pub fn new(
        store: Store,
        prices: Arc<PriceCache>,
        broadcaster: Arc<AccountEventBroadcaster>,
    ) -> Self {
        Self {
            store,
            prices,
            broadcaster,
        }
    }

    /// Close a position, fully or partially, at `exit_price`
    ///
    /// `close_quantity` is clamped to the open quantity; `None` closes the
    /// whole position. The margin released scales with the closed fraction
    /// and the refund is `max(0, margin released + realized PnL)`; a loss
    /// deeper than the released margin refunds nothing. Returns `Ok(None)`
    /// when the position no longer exists.
    pub async fn close(
        &self,
        position_id: Uuid,
        exit_price: Decimal,
        close_quantity: Option<Decimal>,
    ) -> Result<Option<CloseOutcome>, FuturesError> {
        if let Some(quantity) = close_quantity {
            if quantity <= Decimal::ZERO {
                return Err(FuturesError::Validation(format!(
                    "close quantity must be positive, got {quantity}"
                )));
            }
        }

        let mut tx = self.store.begin().await;
        let Some(mut position) = tx.position(position_id) else {
            return Ok(None);
        };
        let pair = SymbolPair::parse(&position.symbol)?;

        let closed_quantity = close_quantity
            .unwrap_or(position.quantity)
            .min(position.quantity);
        let diff = match position.side.is_long() {
            true => exit_price - position.entry_price,
            false => position.entry_price - exit_price,
        };
        let realized_pnl = closed_quantity * diff;
        let margin_released = closed_quantity / position.quantity * position.margin;
        let refund = (margin_released + realized_pnl).max(Decimal::ZERO);

        let account = if refund > Decimal::ZERO {
            Some(ledger::receive(
                &mut tx,
                position.user_id,
                WalletKind::Futures,
                pair.quote().as_str(),
                refund,
            )?)
        } else {
            None
        };

        let full_close = closed_quantity >= position.quantity;
        let now = Utc::now();
        tx.push_history(PositionHistory {
            id: Uuid::new_v4(),
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity: closed_quantity,
            leverage: position.leverage,
            margin: margin_released,
            realized_pnl,
            note: (!full_close).then(|| "Partial Close".to_string()),
            closed_at: now,
        });

        let remaining = if full_close {
            tx.remove_position(position.id);
            None
        } else {
            position.quantity -= closed_quantity;
            position.margin -= margin_released;
            position.realized_pnl += realized_pnl;
            position.updated_at = now;
            tx.put_position(position.clone());
            Some(position.clone())
        };
        tx.commit();

        let mut events = Vec::new();
        if let Some(account) = &account {
            events.push(AccountEvent::balance(account));
        }
        events.push(AccountEvent::position(
            position.symbol.clone(),
            remaining.clone(),
        ));
        self.broadcaster.emit_all(position.user_id, events);

        info!(
            user_id = %position.user_id,
            symbol = %position.symbol,
            quantity = %closed_quantity,
            %exit_price,
            pnl = %realized_pnl,
            %refund,
            full = full_close,
            "position closed"
        );
        Ok(Some(CloseOutcome {
            position_id,
            symbol: position.symbol,
            closed_quantity,
            exit_price,
            realized_pnl,
            margin_released,
            refund,
            remaining,
        }))
    }

    /// Forcibly close a position whose equity ran out
    ///
    /// The full margin is forfeited; nothing returns to the wallet. Returns
    /// `Ok(None)` when the position vanished before the transaction.
    pub async fn liquidate(
        &self,
        position_id: Uuid,
        mark_price: Decimal,
    ) -> Result<Option<PositionHistory>, FuturesError> {
        let mut tx = self.store.begin().await;
        let Some(position) = tx.position(position_id) else {
            return Ok(None);
        };

        let row = PositionHistory {
            id: Uuid::new_v4(),
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price: mark_price,
            quantity: position.quantity,
            leverage: position.leverage,
            margin: position.margin,
            realized_pnl: position.unrealized_pnl(mark_price),
            note: Some("Liquidated".to_string()),
            closed_at: Utc::now(),
        };
        tx.push_history(row.clone());
        tx.remove_position(position.id);
        tx.commit();

        self.broadcaster.emit(
            position.user_id,
            AccountEvent::position(position.symbol.clone(), None),
        );
        info!(
            user_id = %position.user_id,
            symbol = %position.symbol,
            %mark_price,
            lost_margin = %position.margin,
            "position liquidated"
        );
        Ok(Some(row))
    }

    /// Close the user's position for `symbol` at the current market price
    ///
    /// When no price is obtainable the position closes at its own entry
    /// price, settling zero PnL rather than blocking the close.
    pub async fn close_position(
        &self,
        user_id: Uuid,
        symbol: &str,
        quantity: Option<Decimal>,
    ) -> Result<CloseOutcome, FuturesError> {
        let pair = SymbolPair::parse(symbol)?;
        let position = self
            .store
            .position_for_symbol(user_id, pair.as_str())
            .await
            .ok_or_else(|| FuturesError::PositionNotFound(pair.as_str().to_string()))?;

        let exit_price = match self.prices.get_price(pair.as_str()).await {
            Ok(price) => price,
            Err(err) => {
                debug!(symbol = %pair.as_str(), error = %err, "no price for close, using entry");
                position.entry_price
            }
        };

        self.close(position.id, exit_price, quantity)
            .await?
            .ok_or_else(|| FuturesError::PositionNotFound(pair.as_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::portfolio::PortfolioService;
    use crate::services::support::{empty_cache, position_fixture, warm_cache};
    use rust_decimal_macros::dec;

    fn quiet_broadcaster(store: &Store) -> Arc<AccountEventBroadcaster> {
        let portfolio = Arc::new(PortfolioService::new(store.clone(), empty_cache()));
        Arc::new(AccountEventBroadcaster::new(
            portfolio,
            std::time::Duration::from_secs(3600),
        ))
    }

    fn closer(store: &Store, prices: Arc<PriceCache>) -> PositionCloser {
        PositionCloser::new(store.clone(), prices, quiet_broadcaster(store))
    }

    async fn seed_position(store: &Store, user: Uuid) -> Position {
        let position = position_fixture(user, "BTCUSDT");
        let mut tx = store.begin().await;
        tx.put_position(position.clone());
        tx.commit();
        position
    }

    #[tokio::test]
    async fn test_full_close_refunds_margin_plus_profit() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = seed_position(&store, user).await;

        let closer = closer(&store, empty_cache());
        let outcome = closer
            .close(position.id, dec!(52000), None)
            .await
            .unwrap()
            .unwrap();

        // 0.02 * 2000 profit on top of the 100 margin
        assert_eq!(outcome.realized_pnl, dec!(40));
        assert_eq!(outcome.refund, dec!(140));
        assert!(outcome.remaining.is_none());
        assert!(store.position(position.id).await.is_none());

        let usdt = store.balance(user, WalletKind::Futures, "USDT").await.unwrap();
        assert_eq!(usdt.available, dec!(140));

        let history = store.recent_history(user, 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].quantity, dec!(0.02));
        assert_eq!(history[0].margin, dec!(100));
        assert_eq!(history[0].note, None);
    }

    #[tokio::test]
    async fn test_partial_closes_scale_margin_and_accumulate_pnl() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = seed_position(&store, user).await;

        let closer = closer(&store, empty_cache());
        let first = closer
            .close(position.id, dec!(52000), Some(dec!(0.01)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.realized_pnl, dec!(20));
        assert_eq!(first.margin_released, dec!(50));
        assert_eq!(first.refund, dec!(70));

        let remaining = first.remaining.unwrap();
        assert_eq!(remaining.quantity, dec!(0.01));
        assert_eq!(remaining.margin, dec!(50));
        assert_eq!(remaining.realized_pnl, dec!(20));
        // untouched by the partial close
        assert_eq!(remaining.liquidation_price, dec!(45500));

        let second = closer
            .close(position.id, dec!(51000), Some(dec!(0.004)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.realized_pnl, dec!(4));
        assert_eq!(second.margin_released, dec!(20));
        let remaining = second.remaining.unwrap();
        assert_eq!(remaining.quantity, dec!(0.006));
        assert_eq!(remaining.margin, dec!(30));
        assert_eq!(remaining.realized_pnl, dec!(24));

        let usdt = store.balance(user, WalletKind::Futures, "USDT").await.unwrap();
        assert_eq!(usdt.available, dec!(94));

        let history = store.recent_history(user, 10).await;
        assert_eq!(history.len(), 2);
        assert!(history
            .iter()
            .all(|row| row.note.as_deref() == Some("Partial Close")));
    }

    #[tokio::test]
    async fn test_refund_floors_at_zero_on_deep_loss() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = seed_position(&store, user).await;

        // 120 loss against 100 margin
        let closer = closer(&store, empty_cache());
        let outcome = closer
            .close(position.id, dec!(44000), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.realized_pnl, dec!(-120));
        assert_eq!(outcome.refund, Decimal::ZERO);
        assert!(store.balance(user, WalletKind::Futures, "USDT").await.is_none());

        let history = store.recent_history(user, 10).await;
        assert_eq!(history[0].realized_pnl, dec!(-120));
        assert_eq!(history[0].note, None);
    }

    #[tokio::test]
    async fn test_close_quantity_clamps_to_position() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = seed_position(&store, user).await;

        let closer = closer(&store, empty_cache());
        assert!(matches!(
            closer.close(position.id, dec!(50000), Some(Decimal::ZERO)).await,
            Err(FuturesError::Validation(_))
        ));

        let outcome = closer
            .close(position.id, dec!(50000), Some(dec!(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.closed_quantity, dec!(0.02));
        assert!(outcome.remaining.is_none());
    }

    #[tokio::test]
    async fn test_liquidation_forfeits_margin() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = seed_position(&store, user).await;

        let closer = closer(&store, empty_cache());
        let row = closer
            .liquidate(position.id, dec!(45000))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(row.note.as_deref(), Some("Liquidated"));
        assert_eq!(row.exit_price, dec!(45000));
        assert_eq!(row.margin, dec!(100));
        assert_eq!(row.realized_pnl, dec!(-100));

        assert!(store.position(position.id).await.is_none());
        // nothing comes back to the wallet
        assert!(store.balance(user, WalletKind::Futures, "USDT").await.is_none());

        // raced-away positions are a no-op
        assert!(closer.liquidate(position.id, dec!(45000)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_close_falls_back_to_entry_price() {
        let store = Store::new();
        let user = Uuid::new_v4();
        seed_position(&store, user).await;

        // no price anywhere: the close settles flat at the entry
        let closer = closer(&store, empty_cache());
        let outcome = closer.close_position(user, "BTCUSDT", None).await.unwrap();

        assert_eq!(outcome.exit_price, dec!(50000));
        assert_eq!(outcome.realized_pnl, Decimal::ZERO);
        assert_eq!(outcome.refund, dec!(100));
    }

    #[tokio::test]
    async fn test_manual_close_uses_market_price() {
        let store = Store::new();
        let user = Uuid::new_v4();
        seed_position(&store, user).await;

        let closer = closer(&store, warm_cache(&[("BTCUSDT", dec!(51000))]));
        let outcome = closer.close_position(user, "BTCUSDT", None).await.unwrap();

        assert_eq!(outcome.exit_price, dec!(51000));
        assert_eq!(outcome.realized_pnl, dec!(20));
    }

    #[tokio::test]
    async fn test_manual_close_requires_a_position() {
        let store = Store::new();
        let closer = closer(&store, empty_cache());
        assert!(matches!(
            closer.close_position(Uuid::new_v4(), "BTCUSDT", None).await,
            Err(FuturesError::PositionNotFound(_))
        ));
    }
}
