//! Spot order service and matching sweep
//!
//! Market orders clear immediately against the cached price. Limit orders
//! that cross at placement clear at their limit price; the rest reserve
//! the held side and wait for [`SpotMatchingEngine::match_limit_orders`],
//! which the market feed triggers on every price change.
//!
//! Every placement, cancel and sweep is one store transaction; account
//! events are collected along the way and flushed only after commit.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::ledger::{self, LedgerError};
use crate::models::{
    OrderStatus, OrderType, SpotOrder, SpotSide, SymbolError, SymbolPair, WalletKind,
};
use crate::services::price::PriceCache;
use crate::store::Store;
use crate::ws::{AccountEvent, AccountEventBroadcaster};

#[derive(Debug, thiserror::Error)]
pub enum SpotError {
    #[error("Invalid order: {0}")]
    Validation(String),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error("Insufficient {asset} balance")]
    InsufficientFunds { asset: String },

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),
}

impl From<LedgerError> for SpotError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { asset } => SpotError::InsufficientFunds { asset },
            other => SpotError::Validation(other.to_string()),
        }
    }
}

pub struct SpotOrderService {
    store: Store,
    prices: Arc<PriceCache>,
    broadcaster: Arc<AccountEventBroadcaster>,
}

impl SpotOrderService {
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

    /// Place a market or limit spot order
    ///
    /// `quantity` is in the base asset. Limit orders that already cross the
    /// current price execute immediately at their limit price; the rest
    /// reserve the held side and go on the book as `pending`.
    pub async fn place_order(
        &self,
        user_id: Uuid,
        symbol: &str,
        side: SpotSide,
        order_type: OrderType,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<SpotOrder, SpotError> {
        let pair = SymbolPair::parse(symbol)?;
        if quantity <= Decimal::ZERO {
            return Err(SpotError::Validation(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        let limit_price = match order_type {
            OrderType::Limit => match limit_price {
                Some(price) if price > Decimal::ZERO => Some(price),
                _ => {
                    return Err(SpotError::Validation(
                        "limit orders require a positive price".to_string(),
                    ))
                }
            },
            OrderType::Market => None,
        };

        let current = self
            .prices
            .get_price(pair.as_str())
            .await
            .map_err(|_| SpotError::PriceUnavailable(pair.as_str().to_string()))?;

        let price = limit_price.unwrap_or(current);
        let quote_amount = quantity * price;
        let quote = pair.quote().as_str();

        // a limit order that already crosses clears like a market order,
        // at its own limit price
        let crossable = match limit_price {
            Some(limit) => match side {
                SpotSide::Buy => current <= limit,
                SpotSide::Sell => current >= limit,
            },
            None => true,
        };

        let mut tx = self.store.begin().await;
        let mut events = Vec::new();

        let status = if crossable {
            match side {
                SpotSide::Buy => {
                    let quote_rec =
                        ledger::spend(&mut tx, user_id, WalletKind::Spot, quote, quote_amount)?;
                    let base_rec =
                        ledger::receive(&mut tx, user_id, WalletKind::Spot, pair.base(), quantity)?;
                    events.push(AccountEvent::balance(&quote_rec));
                    events.push(AccountEvent::balance(&base_rec));
                }
                SpotSide::Sell => {
                    let base_rec =
                        ledger::spend(&mut tx, user_id, WalletKind::Spot, pair.base(), quantity)?;
                    let quote_rec =
                        ledger::receive(&mut tx, user_id, WalletKind::Spot, quote, quote_amount)?;
                    events.push(AccountEvent::balance(&base_rec));
                    events.push(AccountEvent::balance(&quote_rec));
                }
            }
            OrderStatus::Filled
        } else {
            let held = match side {
                SpotSide::Buy => {
                    ledger::reserve(&mut tx, user_id, WalletKind::Spot, quote, quote_amount)?
                }
                SpotSide::Sell => {
                    ledger::reserve(&mut tx, user_id, WalletKind::Spot, pair.base(), quantity)?
                }
            };
            events.push(AccountEvent::balance(&held));
            OrderStatus::Pending
        };

        let now = Utc::now();
        let order = SpotOrder {
            id: Uuid::new_v4(),
            user_id,
            symbol: pair.as_str().to_string(),
            base_asset: pair.base().to_string(),
            quote_asset: pair.quote(),
            side,
            order_type,
            quantity_base: quantity,
            price_quote: price,
            quote_amount,
            status,
            created_at: now,
            updated_at: now,
        };
        tx.put_spot_order(order.clone());
        tx.commit();

        events.push(AccountEvent::spot_order(order.clone()));
        self.broadcaster.emit_all(user_id, events);

        info!(
            %user_id,
            order_id = %order.id,
            symbol = %order.symbol,
            %side,
            %quantity,
            %price,
            status = %order.status,
            "spot order placed"
        );
        Ok(order)
    }

    /// Cancel a pending order, releasing whatever it held
    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid) -> Result<SpotOrder, SpotError> {
        let mut tx = self.store.begin().await;

        let mut order = tx
            .spot_order(order_id)
            .filter(|o| o.user_id == user_id)
            .ok_or(SpotError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::Pending {
            return Err(SpotError::Validation(
                "only pending orders can be cancelled".to_string(),
            ));
        }

        let released = match order.side {
            SpotSide::Buy => ledger::unreserve(
                &mut tx,
                user_id,
                WalletKind::Spot,
                order.quote_asset.as_str(),
                order.quote_amount,
            )?,
            SpotSide::Sell => ledger::unreserve(
                &mut tx,
                user_id,
                WalletKind::Spot,
                &order.base_asset,
                order.quantity_base,
            )?,
        };

        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        tx.put_spot_order(order.clone());
        tx.commit();

        self.broadcaster.emit_all(
            user_id,
            [
                AccountEvent::balance(&released),
                AccountEvent::spot_order(order.clone()),
            ],
        );
        info!(%user_id, %order_id, symbol = %order.symbol, "spot order cancelled");
        Ok(order)
    }
}

/// Sweeps resting limit orders against a fresh price
pub struct SpotMatchingEngine {
    store: Store,
    broadcaster: Arc<AccountEventBroadcaster>,
}

impl SpotMatchingEngine {
    pub fn new(store: Store, broadcaster: Arc<AccountEventBroadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Fill every pending order of `symbol` that crosses `current_price`
    ///
    /// The whole sweep is one transaction: a failure aborts every fill of
    /// this invocation and the next price change retries. Returns the
    /// number of orders filled.
    pub async fn match_limit_orders(
        &self,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<usize, SpotError> {
        let mut tx = self.store.begin().await;
        let pending = tx.pending_spot_orders(symbol);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut events: Vec<(Uuid, Vec<AccountEvent>)> = Vec::new();

        for mut order in pending {
            let crosses = match order.side {
                SpotSide::Buy => current_price <= order.price_quote,
                SpotSide::Sell => current_price >= order.price_quote,
            };
            if !crosses {
                continue;
            }

            let user_id = order.user_id;
            let quote = order.quote_asset.as_str();

            // release the hold, then settle both legs at the stored amounts
            let (debit, credit) = match order.side {
                SpotSide::Buy => {
                    ledger::unreserve(&mut tx, user_id, WalletKind::Spot, quote, order.quote_amount)?;
                    let quote_rec =
                        ledger::spend(&mut tx, user_id, WalletKind::Spot, quote, order.quote_amount)?;
                    let base_rec = ledger::receive(
                        &mut tx,
                        user_id,
                        WalletKind::Spot,
                        &order.base_asset,
                        order.quantity_base,
                    )?;
                    (quote_rec, base_rec)
                }
                SpotSide::Sell => {
                    ledger::unreserve(
                        &mut tx,
                        user_id,
                        WalletKind::Spot,
                        &order.base_asset,
                        order.quantity_base,
                    )?;
                    let base_rec = ledger::spend(
                        &mut tx,
                        user_id,
                        WalletKind::Spot,
                        &order.base_asset,
                        order.quantity_base,
                    )?;
                    let quote_rec =
                        ledger::receive(&mut tx, user_id, WalletKind::Spot, quote, order.quote_amount)?;
                    (base_rec, quote_rec)
                }
            };

            order.status = OrderStatus::Filled;
            order.updated_at = Utc::now();
            tx.put_spot_order(order.clone());

            events.push((
                user_id,
                vec![
                    AccountEvent::balance(&debit),
                    AccountEvent::balance(&credit),
                    AccountEvent::spot_order(order),
                ],
            ));
        }

        let filled = events.len();
        if filled == 0 {
            return Ok(0);
        }
        tx.commit();

        for (user_id, user_events) in events {
            self.broadcaster.emit_all(user_id, user_events);
        }
        info!(symbol, %current_price, filled, "limit orders executed");
        Ok(filled)
    }
}
