//! In-process transactional store
//!
//! Supplies the document-store contract the engine is written against:
//! per-entity collections plus an atomic multi-record transaction. A
//! [`StoreTx`] starts by taking the store's single async mutex, records an
//! undo entry for every record it overwrites, and rolls those back on drop
//! unless [`StoreTx::commit`] ran — so a unit that errors midway leaves no
//! partial effect, and commits are serialized by construction.
//!
//! Reads outside a transaction take the lock briefly and return clones;
//! they are point-in-time snapshots, nothing more.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;
use uuid::Uuid;

use crate::models::{
    BalanceRecord, FuturesOrder, OrderStatus, OrderType, Position, PositionHistory, SpotOrder,
    WalletKind,
};

/// (user, wallet, asset)
type BalanceKey = (Uuid, WalletKind, String);

#[derive(Default)]
struct StoreInner {
    balances: HashMap<BalanceKey, BalanceRecord>,
    spot_orders: HashMap<Uuid, SpotOrder>,
    futures_orders: HashMap<Uuid, FuturesOrder>,
    positions: HashMap<Uuid, Position>,
    history: Vec<PositionHistory>,
}

/// Record counts, used for lifecycle logging
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub balances: usize,
    pub spot_orders: usize,
    pub futures_orders: usize,
    pub positions: usize,
    pub history_rows: usize,
}

/// Shared handle to the entity collections
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. Holds the store lock until commit or drop.
    pub async fn begin(&self) -> StoreTx {
        let guard = self.inner.clone().lock_owned().await;
        StoreTx {
            guard,
            undo: Vec::new(),
            committed: false,
        }
    }

    // ========================================================================
    // Point-in-time reads
    // ========================================================================

    pub async fn balance(
        &self,
        user_id: Uuid,
        wallet: WalletKind,
        asset: &str,
    ) -> Option<BalanceRecord> {
        let inner = self.inner.lock().await;
        inner
            .balances
            .get(&(user_id, wallet, asset.to_string()))
            .cloned()
    }

    pub async fn balances_for(&self, user_id: Uuid, wallet: WalletKind) -> Vec<BalanceRecord> {
        let inner = self.inner.lock().await;
        inner
            .balances
            .values()
            .filter(|b| b.user_id == user_id && b.wallet == wallet)
            .cloned()
            .collect()
    }

    pub async fn spot_order(&self, id: Uuid) -> Option<SpotOrder> {
        self.inner.lock().await.spot_orders.get(&id).cloned()
    }

    pub async fn futures_order(&self, id: Uuid) -> Option<FuturesOrder> {
        self.inner.lock().await.futures_orders.get(&id).cloned()
    }

    /// All resting futures limit orders, for the fill pass
    pub async fn pending_futures_limit_orders(&self) -> Vec<FuturesOrder> {
        let inner = self.inner.lock().await;
        inner
            .futures_orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.order_type == OrderType::Limit)
            .cloned()
            .collect()
    }

    pub async fn position(&self, id: Uuid) -> Option<Position> {
        self.inner.lock().await.positions.get(&id).cloned()
    }

    pub async fn position_for_symbol(&self, user_id: Uuid, symbol: &str) -> Option<Position> {
        let inner = self.inner.lock().await;
        inner
            .positions
            .values()
            .find(|p| p.user_id == user_id && p.symbol == symbol)
            .cloned()
    }

    pub async fn positions_for(&self, user_id: Uuid) -> Vec<Position> {
        let inner = self.inner.lock().await;
        inner
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.inner.lock().await.positions.values().cloned().collect()
    }

    /// Positions carrying an armed TP or SL target
    pub async fn positions_with_targets(&self) -> Vec<Position> {
        let inner = self.inner.lock().await;
        inner
            .positions
            .values()
            .filter(|p| p.has_take_profit() || p.has_stop_loss())
            .cloned()
            .collect()
    }

    pub async fn recent_spot_orders(&self, user_id: Uuid, limit: usize) -> Vec<SpotOrder> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<SpotOrder> = inner
            .spot_orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        orders
    }

    pub async fn recent_futures_orders(&self, user_id: Uuid, limit: usize) -> Vec<FuturesOrder> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<FuturesOrder> = inner
            .futures_orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders.truncate(limit);
        orders
    }

    pub async fn recent_history(&self, user_id: Uuid, limit: usize) -> Vec<PositionHistory> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<PositionHistory> = inner
            .history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        rows.truncate(limit);
        rows
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().await;
        StoreStats {
            balances: inner.balances.len(),
            spot_orders: inner.spot_orders.len(),
            futures_orders: inner.futures_orders.len(),
            positions: inner.positions.len(),
            history_rows: inner.history.len(),
        }
    }
}

enum Undo {
    Balance {
        key: BalanceKey,
        prev: Option<BalanceRecord>,
    },
    SpotOrder {
        id: Uuid,
        prev: Option<SpotOrder>,
    },
    FuturesOrder {
        id: Uuid,
        prev: Option<FuturesOrder>,
    },
    Position {
        id: Uuid,
        prev: Option<Position>,
    },
    HistoryPushed,
}

/// An open transaction
///
/// Every write logs the overwritten state; dropping the transaction without
/// committing replays the log in reverse, restoring the store exactly.
pub struct StoreTx {
    guard: OwnedMutexGuard<StoreInner>,
    undo: Vec<Undo>,
    committed: bool,
}

impl StoreTx {
    // ========================================================================
    // Reads (transaction-consistent)
    // ========================================================================

    /// Balance record, or a fresh zero record if none exists yet
    pub fn balance_or_default(
        &self,
        user_id: Uuid,
        wallet: WalletKind,
        asset: &str,
    ) -> BalanceRecord {
        self.guard
            .balances
            .get(&(user_id, wallet, asset.to_string()))
            .cloned()
            .unwrap_or_else(|| BalanceRecord::empty(user_id, wallet, asset))
    }

    pub fn spot_order(&self, id: Uuid) -> Option<SpotOrder> {
        self.guard.spot_orders.get(&id).cloned()
    }

    pub fn futures_order(&self, id: Uuid) -> Option<FuturesOrder> {
        self.guard.futures_orders.get(&id).cloned()
    }

    pub fn position(&self, id: Uuid) -> Option<Position> {
        self.guard.positions.get(&id).cloned()
    }

    pub fn position_for_symbol(&self, user_id: Uuid, symbol: &str) -> Option<Position> {
        self.guard
            .positions
            .values()
            .find(|p| p.user_id == user_id && p.symbol == symbol)
            .cloned()
    }

    pub fn pending_spot_orders(&self, symbol: &str) -> Vec<SpotOrder> {
        let mut orders: Vec<SpotOrder> = self
            .guard
            .spot_orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    // ========================================================================
    // Writes (undo-logged)
    // ========================================================================

    pub fn put_balance(&mut self, record: BalanceRecord) {
        let key = (record.user_id, record.wallet, record.asset.clone());
        let prev = self.guard.balances.insert(key.clone(), record);
        self.undo.push(Undo::Balance { key, prev });
    }

    pub fn put_spot_order(&mut self, order: SpotOrder) {
        let prev = self.guard.spot_orders.insert(order.id, order.clone());
        self.undo.push(Undo::SpotOrder { id: order.id, prev });
    }

    pub fn put_futures_order(&mut self, order: FuturesOrder) {
        let prev = self.guard.futures_orders.insert(order.id, order.clone());
        self.undo.push(Undo::FuturesOrder { id: order.id, prev });
    }

    pub fn put_position(&mut self, position: Position) {
        let prev = self.guard.positions.insert(position.id, position.clone());
        self.undo.push(Undo::Position {
            id: position.id,
            prev,
        });
    }

    pub fn remove_position(&mut self, id: Uuid) {
        let prev = self.guard.positions.remove(&id);
        self.undo.push(Undo::Position { id, prev });
    }

    pub fn push_history(&mut self, row: PositionHistory) {
        self.guard.history.push(row);
        self.undo.push(Undo::HistoryPushed);
    }

    /// Make the transaction's writes permanent
    pub fn commit(mut self) {
        self.committed = true;
        trace!(writes = self.undo.len(), "transaction committed");
    }

    fn rollback(&mut self) {
        // Reverse order restores the oldest state last
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Balance { key, prev } => match prev {
                    Some(rec) => {
                        self.guard.balances.insert(key, rec);
                    }
                    None => {
                        self.guard.balances.remove(&key);
                    }
                },
                Undo::SpotOrder { id, prev } => match prev {
                    Some(order) => {
                        self.guard.spot_orders.insert(id, order);
                    }
                    None => {
                        self.guard.spot_orders.remove(&id);
                    }
                },
                Undo::FuturesOrder { id, prev } => match prev {
                    Some(order) => {
                        self.guard.futures_orders.insert(id, order);
                    }
                    None => {
                        self.guard.futures_orders.remove(&id);
                    }
                },
                Undo::Position { id, prev } => match prev {
                    Some(position) => {
                        self.guard.positions.insert(id, position);
                    }
                    None => {
                        self.guard.positions.remove(&id);
                    }
                },
                Undo::HistoryPushed => {
                    self.guard.history.pop();
                }
            }
        }
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if !self.committed && !self.undo.is_empty() {
            trace!(writes = self.undo.len(), "transaction rolled back");
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record(user_id: Uuid, asset: &str) -> BalanceRecord {
        let mut rec = BalanceRecord::empty(user_id, WalletKind::Spot, asset);
        rec.available = dec!(100);
        rec
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = Store::new();
        let user = Uuid::new_v4();

        let mut tx = store.begin().await;
        tx.put_balance(record(user, "USDT"));
        tx.commit();

        let rec = store.balance(user, WalletKind::Spot, "USDT").await.unwrap();
        assert_eq!(rec.available, dec!(100));
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let store = Store::new();
        let user = Uuid::new_v4();

        {
            let mut tx = store.begin().await;
            tx.put_balance(record(user, "USDT"));
            // dropped uncommitted
        }

        assert!(store.balance(user, WalletKind::Spot, "USDT").await.is_none());
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_state_not_empty() {
        let store = Store::new();
        let user = Uuid::new_v4();

        let mut tx = store.begin().await;
        tx.put_balance(record(user, "USDT"));
        tx.commit();

        {
            let mut tx = store.begin().await;
            let mut rec = tx.balance_or_default(user, WalletKind::Spot, "USDT");
            rec.available = dec!(42);
            tx.put_balance(rec.clone());
            tx.put_balance(rec); // second write to the same key
        }

        let rec = store.balance(user, WalletKind::Spot, "USDT").await.unwrap();
        assert_eq!(rec.available, dec!(100));
    }

    #[tokio::test]
    async fn test_rollback_unwinds_position_delete_and_history() {
        let store = Store::new();
        let user = Uuid::new_v4();
        let position = Position {
            id: Uuid::new_v4(),
            user_id: user,
            symbol: "BTCUSDT".to_string(),
            side: crate::models::PositionSide::Long,
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
        };

        let mut tx = store.begin().await;
        tx.put_position(position.clone());
        tx.commit();

        {
            let mut tx = store.begin().await;
            tx.push_history(PositionHistory {
                id: Uuid::new_v4(),
                user_id: user,
                symbol: "BTCUSDT".to_string(),
                side: crate::models::PositionSide::Long,
                entry_price: dec!(50000),
                exit_price: dec!(51000),
                quantity: dec!(0.02),
                leverage: 10,
                margin: dec!(100),
                realized_pnl: dec!(20),
                note: None,
                closed_at: Utc::now(),
            });
            tx.remove_position(position.id);
            // dropped uncommitted
        }

        assert!(store.position(position.id).await.is_some());
        assert!(store.recent_history(user, 10).await.is_empty());
    }
}
