//! Futures order placement, cancellation and TP/SL target updates
//!
//! Orders are margin-sized: the caller supplies a notional and a leverage,
//! and `notional / leverage` is taken from the futures wallet at placement.
//! Market orders open or merge a position immediately; limit orders park
//! the margin in reserve until the fill pass releases it.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::ledger::{self, funds_tolerance};
use crate::models::{
    FuturesOrder, OrderStatus, OrderType, Position, PositionSide, SymbolPair, WalletKind,
};
use crate::services::price::PriceCache;
use crate::store::{Store, StoreTx};
use crate::ws::{AccountEvent, AccountEventBroadcaster};

use super::{fill_liquidation_price, placement_liquidation_price, FuturesError};

/// Partial TP/SL update; `None` keeps the current value, zero clears it
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetUpdate {
    pub take_profit_price: Option<Decimal>,
    pub take_profit_quantity: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub stop_loss_quantity: Option<Decimal>,
}

pub struct FuturesOrderService {
    store: Store,
    prices: Arc<PriceCache>,
    broadcaster: Arc<AccountEventBroadcaster>,
}

impl FuturesOrderService {
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

    /// Place a market or limit futures order
    ///
    /// `notional` is the position size in the quote asset before leverage.
    /// Market orders fill at the cached price and open or grow the user's
    /// position for the symbol in the same transaction.
    pub async fn place_order(
        &self,
        user_id: Uuid,
        symbol: &str,
        side: PositionSide,
        order_type: OrderType,
        notional: Decimal,
        leverage: u32,
        limit_price: Option<Decimal>,
    ) -> Result<FuturesOrder, FuturesError> {
        let pair = SymbolPair::parse(symbol)?;
        if notional <= Decimal::ZERO {
            return Err(FuturesError::Validation(format!(
                "notional must be positive, got {notional}"
            )));
        }
        if leverage < 1 {
            return Err(FuturesError::Validation(
                "leverage must be at least 1".to_string(),
            ));
        }
        let limit_price = match order_type {
            OrderType::Limit => match limit_price {
                Some(price) if price > Decimal::ZERO => Some(price),
                _ => {
                    return Err(FuturesError::Validation(
                        "limit orders require a positive price".to_string(),
                    ))
                }
            },
            OrderType::Market => None,
        };

        let execution_price = match limit_price {
            Some(price) => price,
            None => self
                .prices
                .get_price(pair.as_str())
                .await
                .map_err(|_| FuturesError::PriceUnavailable(pair.as_str().to_string()))?,
        };

        let margin_required = notional / Decimal::from(leverage);
        let quote = pair.quote().as_str();

        let mut tx = self.store.begin().await;
        let mut account = tx.balance_or_default(user_id, WalletKind::Futures, quote);
        if account.available < margin_required - funds_tolerance() {
            return Err(FuturesError::InsufficientFunds {
                asset: quote.to_string(),
            });
        }
        // the funds check tolerates dust-level shortfalls, so the margin
        // actually taken is clamped to what the wallet holds
        let final_margin = margin_required.min(account.available);
        account.available -= final_margin;
        if limit_price.is_some() {
            account.reserved += final_margin;
        }
        account.snap_dust();
        account.updated_at = Utc::now();
        tx.put_balance(account.clone());

        let base_quantity = notional / execution_price;
        let now = Utc::now();
        let order = FuturesOrder {
            id: Uuid::new_v4(),
            user_id,
            symbol: pair.as_str().to_string(),
            side,
            order_type,
            quantity: base_quantity,
            leverage,
            margin_reserved: final_margin,
            price: execution_price,
            average_price: match order_type {
                OrderType::Market => execution_price,
                OrderType::Limit => Decimal::ZERO,
            },
            status: match order_type {
                OrderType::Market => OrderStatus::Filled,
                OrderType::Limit => OrderStatus::Pending,
            },
            created_at: now,
            updated_at: now,
        };
        tx.put_futures_order(order.clone());

        // market orders take effect on the position right away; the
        // position margin grows by the unclamped requirement
        let position = match order_type {
            OrderType::Market => Some(open_or_merge(
                &mut tx,
                &order,
                execution_price,
                margin_required,
                placement_liquidation_price,
            )),
            OrderType::Limit => None,
        };
        tx.commit();

        let mut events = vec![AccountEvent::balance(&account)];
        if let Some(position) = &position {
            events.push(AccountEvent::position(
                position.symbol.clone(),
                Some(position.clone()),
            ));
        }
        events.push(AccountEvent::futures_order(order.clone()));
        self.broadcaster.emit_all(user_id, events);

        info!(
            %user_id,
            order_id = %order.id,
            symbol = %order.symbol,
            %side,
            %notional,
            leverage,
            price = %execution_price,
            status = %order.status,
            "futures order placed"
        );
        Ok(order)
    }

    /// Cancel a pending limit order and return its reserved margin
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<FuturesOrder, FuturesError> {
        let mut tx = self.store.begin().await;

        let mut order = tx
            .futures_order(order_id)
            .filter(|o| o.user_id == user_id)
            .ok_or(FuturesError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Pending {
            return Err(FuturesError::Validation(
                "only pending orders can be cancelled".to_string(),
            ));
        }

        let pair = SymbolPair::parse(&order.symbol)?;
        let account = if order.margin_reserved > Decimal::ZERO {
            ledger::unreserve(
                &mut tx,
                user_id,
                WalletKind::Futures,
                pair.quote().as_str(),
                order.margin_reserved,
            )?
        } else {
            tx.balance_or_default(user_id, WalletKind::Futures, pair.quote().as_str())
        };

        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        tx.put_futures_order(order.clone());
        tx.commit();

        self.broadcaster.emit_all(
            user_id,
            [
                AccountEvent::balance(&account),
                AccountEvent::futures_order(order.clone()),
            ],
        );
        info!(%user_id, %order_id, symbol = %order.symbol, "futures order cancelled");
        Ok(order)
    }

    /// Fill a resting limit order at `fill_price`
    ///
    /// Called by the engine once the market crosses the limit. The order is
    /// re-checked under the transaction; a cancel that won the race makes
    /// this a no-op returning `Ok(None)`.
    pub async fn fill_order(
        &self,
        order_id: Uuid,
        fill_price: Decimal,
    ) -> Result<Option<FuturesOrder>, FuturesError> {
        let mut tx = self.store.begin().await;
        let Some(mut order) = tx.futures_order(order_id) else {
            return Ok(None);
        };
        if order.status != OrderStatus::Pending {
            return Ok(None);
        }
        let pair = SymbolPair::parse(&order.symbol)?;
        let now = Utc::now();

        order.status = OrderStatus::Filled;
        order.average_price = fill_price;
        order.updated_at = now;
        tx.put_futures_order(order.clone());

        // margin left `available` at placement; filling only releases the
        // hold, the funds stay consumed as position margin
        let mut account =
            tx.balance_or_default(order.user_id, WalletKind::Futures, pair.quote().as_str());
        account.reserved = (account.reserved - order.margin_reserved).max(Decimal::ZERO);
        account.snap_dust();
        account.updated_at = now;
        tx.put_balance(account.clone());

        let position = open_or_merge(
            &mut tx,
            &order,
            fill_price,
            order.margin_reserved,
            fill_liquidation_price,
        );
        tx.commit();

        self.broadcaster.emit_all(
            order.user_id,
            [
                AccountEvent::balance(&account),
                AccountEvent::position(order.symbol.clone(), Some(position)),
                AccountEvent::futures_order(order.clone()),
            ],
        );
        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            price = %fill_price,
            "limit order filled"
        );
        Ok(Some(order))
    }

    /// Set or clear the TP/SL targets on the user's position for `symbol`
    ///
    /// Fields left `None` keep their current value; a target price of zero
    /// disarms that side.
    pub async fn set_position_targets(
        &self,
        user_id: Uuid,
        symbol: &str,
        update: TargetUpdate,
    ) -> Result<Position, FuturesError> {
        let pair = SymbolPair::parse(symbol)?;
        for value in [
            update.take_profit_price,
            update.take_profit_quantity,
            update.stop_loss_price,
            update.stop_loss_quantity,
        ]
        .into_iter()
        .flatten()
        {
            if value < Decimal::ZERO {
                return Err(FuturesError::Validation(format!(
                    "target prices and quantities cannot be negative, got {value}"
                )));
            }
        }

        let mut tx = self.store.begin().await;
        let mut position = tx
            .position_for_symbol(user_id, pair.as_str())
            .ok_or_else(|| FuturesError::PositionNotFound(pair.as_str().to_string()))?;

        if let Some(price) = update.take_profit_price {
            position.tp_price = price;
        }
        if let Some(quantity) = update.take_profit_quantity {
            position.tp_quantity = quantity;
        }
        if let Some(price) = update.stop_loss_price {
            position.sl_price = price;
        }
        if let Some(quantity) = update.stop_loss_quantity {
            position.sl_quantity = quantity;
        }
        position.updated_at = Utc::now();
        tx.put_position(position.clone());
        tx.commit();

        self.broadcaster.emit(
            user_id,
            AccountEvent::position(position.symbol.clone(), Some(position.clone())),
        );
        info!(
            %user_id,
            symbol = %position.symbol,
            tp = %position.tp_price,
            sl = %position.sl_price,
            "position targets updated"
        );
        Ok(position)
    }
}

/// Merge the order into the user's position for the symbol, or open a new
/// one. Merges are side-blind: quantity and margin add up and the entry
/// price is quantity-weighted, whatever side the order was.
fn open_or_merge(
    tx: &mut StoreTx,
    order: &FuturesOrder,
    entry_price: Decimal,
    added_margin: Decimal,
    liquidation_price: fn(PositionSide, Decimal, Decimal, Decimal) -> Decimal,
) -> Position {
    let now = Utc::now();
    let position = match tx.position_for_symbol(order.user_id, &order.symbol) {
        Some(mut position) => {
            let total_quantity = position.quantity + order.quantity;
            position.entry_price = (position.entry_price * position.quantity
                + entry_price * order.quantity)
                / total_quantity;
            position.quantity = total_quantity;
            position.margin += added_margin;
            position.liquidation_price = liquidation_price(
                position.side,
                position.entry_price,
                position.margin,
                position.quantity,
            );
            position.updated_at = now;
            position
        }
        None => Position {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            entry_price,
            leverage: order.leverage,
            margin: added_margin,
            liquidation_price: liquidation_price(
                order.side,
                entry_price,
                added_margin,
                order.quantity,
            ),
            tp_price: Decimal::ZERO,
            tp_quantity: Decimal::ZERO,
            sl_price: Decimal::ZERO,
            sl_quantity: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        },
    };
    tx.put_position(position.clone());
    position
}
