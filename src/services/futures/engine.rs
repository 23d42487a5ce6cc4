//! Scheduled futures engine
//!
//! One loop, three passes per tick: fill resting limit orders whose price
//! crossed, fire armed TP/SL targets, liquidate positions whose equity ran
//! out. Each entity settles in its own transaction and re-checks its
//! trigger there, so a pass survives individual failures and a stale
//! snapshot never double-fires.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::futures::closer::PositionCloser;
use crate::services::futures::orders::FuturesOrderService;
use crate::services::price::PriceCache;
use crate::store::Store;

#[derive(Clone)]
pub struct FuturesEngine {
    store: Store,
    prices: Arc<PriceCache>,
    orders: Arc<FuturesOrderService>,
    closer: Arc<PositionCloser>,
    tick_interval: Duration,
    runner: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl FuturesEngine {
    pub fn new(
        store: Store,
        prices: Arc<PriceCache>,
        orders: Arc<FuturesOrderService>,
        closer: Arc<PositionCloser>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            prices,
            orders,
            closer,
            tick_interval,
            runner: Arc::new(Mutex::new(None)),
        }
    }

    fn runner(&self) -> std::sync::MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.runner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the tick loop. A second call while running is a no-op.
    pub fn start(&self) {
        let mut runner = self.runner();
        if runner.is_some() {
            debug!("futures engine already running");
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.tick_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("futures engine loop exited");
        });
        *runner = Some(stop_tx);
        info!(interval_ms = self.tick_interval.as_millis() as u64, "futures engine started");
    }

    pub fn stop(&self) {
        if let Some(stop) = self.runner().take() {
            let _ = stop.send(true);
            info!("futures engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner().is_some()
    }

    /// One engine pass: limit fills, then targets, then liquidations
    pub async fn tick(&self) {
        self.process_limit_orders().await;
        self.process_targets().await;
        self.process_liquidations().await;
    }

    async fn process_limit_orders(&self) {
        let pending = self.store.pending_futures_limit_orders().await;
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "checking resting limit orders");
        for order in pending {
            let price = match self.prices.get_price(&order.symbol).await {
                Ok(price) => price,
                Err(err) => {
                    debug!(symbol = %order.symbol, error = %err, "no price, fill check skipped");
                    continue;
                }
            };
            if !order.crosses(price) {
                continue;
            }
            match self.orders.fill_order(order.id, price).await {
                Ok(Some(_)) | Ok(None) => {}
                Err(err) => warn!(order_id = %order.id, error = %err, "limit fill failed"),
            }
        }
    }

    async fn process_targets(&self) {
        for position in self.store.positions_with_targets().await {
            let price = match self.prices.get_price(&position.symbol).await {
                Ok(price) => price,
                Err(err) => {
                    debug!(symbol = %position.symbol, error = %err, "no price, target check skipped");
                    continue;
                }
            };
            let is_long = position.side.is_long();
            let hit_tp = position.has_take_profit()
                && if is_long {
                    price >= position.tp_price
                } else {
                    price <= position.tp_price
                };
            let hit_sl = position.has_stop_loss()
                && if is_long {
                    price <= position.sl_price
                } else {
                    price >= position.sl_price
                };
            // take-profit outranks stop-loss when both cross
            if !hit_tp && !hit_sl {
                continue;
            }

            let Some(armed_quantity) = self.disarm_target(position.id, price, hit_tp).await else {
                continue;
            };
            info!(
                position_id = %position.id,
                symbol = %position.symbol,
                kind = if hit_tp { "take_profit" } else { "stop_loss" },
                %price,
                "target triggered"
            );
            // an armed quantity of zero means close everything
            let quantity = (armed_quantity > Decimal::ZERO).then_some(armed_quantity);
            if let Err(err) = self.closer.close(position.id, price, quantity).await {
                warn!(position_id = %position.id, error = %err, "target close failed");
            }
        }
    }

    /// Re-check the trigger under the transaction and clear the target so
    /// it cannot fire twice. Returns the quantity the target was armed with.
    async fn disarm_target(
        &self,
        position_id: Uuid,
        price: Decimal,
        take_profit: bool,
    ) -> Option<Decimal> {
        let mut tx = self.store.begin().await;
        let Some(mut position) = tx.position(position_id) else {
            return None;
        };
        let is_long = position.side.is_long();
        let armed_quantity = if take_profit {
            let still_hit = position.has_take_profit()
                && if is_long {
                    price >= position.tp_price
                } else {
                    price <= position.tp_price
                };
            if !still_hit {
                return None;
            }
            let quantity = position.tp_quantity;
            position.tp_price = Decimal::ZERO;
            position.tp_quantity = Decimal::ZERO;
            quantity
        } else {
            let still_hit = position.has_stop_loss()
                && if is_long {
                    price <= position.sl_price
                } else {
                    price >= position.sl_price
                };
            if !still_hit {
                return None;
            }
            let quantity = position.sl_quantity;
            position.sl_price = Decimal::ZERO;
            position.sl_quantity = Decimal::ZERO;
            quantity
        };
        position.updated_at = Utc::now();
        tx.put_position(position);
        tx.commit();
        Some(armed_quantity)
    }

    async fn process_liquidations(&self) {
        for position in self.store.open_positions().await {
            let price = match self.prices.get_price(&position.symbol).await {
                Ok(price) => price,
                Err(err) => {
                    debug!(symbol = %position.symbol, error = %err, "no price, liquidation check skipped");
                    continue;
                }
            };
            if position.margin > Decimal::ZERO && position.margin_ratio(price) > Decimal::ZERO {
                continue;
            }
            match self.closer.liquidate(position.id, price).await {
                Ok(_) => {}
                Err(err) => {
                    error!(position_id = %position.id, error = %err, "liquidation failed")
                }
            }
        }
    }
}
