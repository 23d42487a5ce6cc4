//! Account event fan-out
//!
//! Keeps a per-user registry of event sinks (one per connected socket) and
//! pushes balance, position and order updates to every sink a user has
//! open. Delivery is fire-and-forget: no queuing, no retry, and a dead
//! sink never affects its neighbours.
//!
//! While at least one sink is registered, a background task broadcasts each
//! user's portfolio valuation on a fixed interval. The task starts with the
//! first sink and is torn down when the registry empties; both transitions
//! happen under the registry lock so an orphaned timer cannot survive a
//! disconnect race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{BalanceRecord, FuturesOrder, Position, SpotOrder, WalletKind};
use crate::services::portfolio::PortfolioService;

/// Order document carried by an order update
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OrderPayload {
    Spot(SpotOrder),
    Futures(FuturesOrder),
}

/// Push events delivered to a user's subscribed sockets
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AccountEvent {
    BalanceUpdate {
        wallet: WalletKind,
        asset: String,
        available: Decimal,
        reserved: Decimal,
    },
    /// `position: None` announces that the position was closed or liquidated
    PositionUpdate {
        symbol: String,
        position: Option<Position>,
    },
    OrderUpdate {
        order: OrderPayload,
    },
    PortfolioUpdate {
        total_usd: Decimal,
        timestamp: i64,
    },
}

impl AccountEvent {
    pub fn balance(record: &BalanceRecord) -> Self {
        AccountEvent::BalanceUpdate {
            wallet: record.wallet,
            asset: record.asset.clone(),
            available: record.available,
            reserved: record.reserved,
        }
    }

    pub fn position(symbol: impl Into<String>, position: Option<Position>) -> Self {
        AccountEvent::PositionUpdate {
            symbol: symbol.into(),
            position,
        }
    }

    pub fn spot_order(order: SpotOrder) -> Self {
        AccountEvent::OrderUpdate {
            order: OrderPayload::Spot(order),
        }
    }

    pub fn futures_order(order: FuturesOrder) -> Self {
        AccountEvent::OrderUpdate {
            order: OrderPayload::Futures(order),
        }
    }

    fn portfolio(total_usd: Decimal) -> Self {
        AccountEvent::PortfolioUpdate {
            total_usd,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

type Sink = mpsc::UnboundedSender<AccountEvent>;

#[derive(Default)]
struct Registry {
    // user -> sink id -> sender
    sinks: HashMap<Uuid, HashMap<Uuid, Sink>>,
    portfolio_task: Option<JoinHandle<()>>,
}

pub struct AccountEventBroadcaster {
    registry: Arc<Mutex<Registry>>,
    portfolio: Arc<PortfolioService>,
    broadcast_interval: Duration,
}

impl AccountEventBroadcaster {
    pub fn new(portfolio: Arc<PortfolioService>, broadcast_interval: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            portfolio,
            broadcast_interval,
        }
    }

    fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a sink for `user_id`; returns its id and the receiving end
    ///
    /// The first sink overall starts the portfolio broadcast task.
    pub fn subscribe(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<AccountEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink_id = Uuid::new_v4();

        let mut registry = Self::lock(&self.registry);
        registry.sinks.entry(user_id).or_default().insert(sink_id, sender);
        if registry.portfolio_task.is_none() {
            registry.portfolio_task = Some(self.spawn_portfolio_task());
            info!(
                interval_ms = self.broadcast_interval.as_millis() as u64,
                "portfolio broadcast started"
            );
        }
        debug!(%user_id, %sink_id, "account sink subscribed");
        (sink_id, receiver)
    }

    /// Drop a sink; the last one overall tears the portfolio task down
    pub fn unsubscribe(&self, user_id: Uuid, sink_id: Uuid) {
        let mut registry = Self::lock(&self.registry);
        if let Some(user_sinks) = registry.sinks.get_mut(&user_id) {
            user_sinks.remove(&sink_id);
            if user_sinks.is_empty() {
                registry.sinks.remove(&user_id);
            }
        }
        if registry.sinks.is_empty() {
            if let Some(task) = registry.portfolio_task.take() {
                task.abort();
                info!("portfolio broadcast stopped, no sinks left");
            }
        }
        debug!(%user_id, %sink_id, "account sink unsubscribed");
    }

    /// Push one event to every sink the user has open
    pub fn emit(&self, user_id: Uuid, event: AccountEvent) {
        Self::fan_out(&self.registry, user_id, event);
    }

    pub fn emit_all(&self, user_id: Uuid, events: impl IntoIterator<Item = AccountEvent>) {
        for event in events {
            self.emit(user_id, event);
        }
    }

    /// Drop every sink and stop the portfolio task
    pub fn shutdown(&self) {
        let mut registry = Self::lock(&self.registry);
        registry.sinks.clear();
        if let Some(task) = registry.portfolio_task.take() {
            task.abort();
        }
        info!("account broadcaster shut down");
    }

    pub fn sink_count(&self) -> usize {
        Self::lock(&self.registry)
            .sinks
            .values()
            .map(|sinks| sinks.len())
            .sum()
    }

    pub fn portfolio_task_running(&self) -> bool {
        Self::lock(&self.registry).portfolio_task.is_some()
    }

    fn fan_out(registry: &Mutex<Registry>, user_id: Uuid, event: AccountEvent) {
        // clone the senders out so sends happen outside the lock
        let senders: Vec<Sink> = {
            let registry = Self::lock(registry);
            match registry.sinks.get(&user_id) {
                Some(sinks) => sinks.values().cloned().collect(),
                None => return,
            }
        };
        for sender in senders {
            // a closed receiver is just a socket that went away mid-send
            let _ = sender.send(event.clone());
        }
    }

    fn spawn_portfolio_task(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let portfolio = Arc::clone(&self.portfolio);
        let period = self.broadcast_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let users: Vec<Uuid> = Self::lock(&registry).sinks.keys().copied().collect();
                for user_id in users {
                    let total = portfolio.total_portfolio_usd(user_id).await;
                    Self::fan_out(&registry, user_id, AccountEvent::portfolio(total));
                }
            }
        })
    }
}
