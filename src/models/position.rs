//! Futures positions and their audit trail
//!
//! A position exists only while its quantity is positive: created on the
//! first qualifying fill, grown by same-symbol fills (weighted-average
//! entry), shrunk by closes, deleted at zero. Every reduction writes an
//! append-only [`PositionHistory`] row, the sole record of realized results.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::PositionSide;

/// An open leveraged position, at most one per (user, symbol)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,

    /// Base-asset quantity, strictly positive while the position exists
    pub quantity: Decimal,

    pub entry_price: Decimal,
    pub leverage: u32,

    /// Margin backing the position, strictly positive
    pub margin: Decimal,

    pub liquidation_price: Decimal,

    /// Take-profit / stop-loss targets; zero means unset. A target
    /// quantity of zero means the full position closes on trigger.
    pub tp_price: Decimal,
    pub tp_quantity: Decimal,
    pub sl_price: Decimal,
    pub sl_quantity: Decimal,

    /// PnL already realized by partial closes of this position
    pub realized_pnl: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Paper gains or losses at the given mark price
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        let diff = match self.side {
            PositionSide::Long => mark_price - self.entry_price,
            PositionSide::Short => self.entry_price - mark_price,
        };
        self.quantity * diff
    }

    /// Margin plus unrealized PnL
    pub fn equity(&self, mark_price: Decimal) -> Decimal {
        self.margin + self.unrealized_pnl(mark_price)
    }

    /// Equity over margin; the position liquidates when this reaches zero
    pub fn margin_ratio(&self, mark_price: Decimal) -> Decimal {
        self.equity(mark_price) / self.margin
    }

    pub fn has_take_profit(&self) -> bool {
        self.tp_price > Decimal::ZERO
    }

    pub fn has_stop_loss(&self) -> bool {
        self.sl_price > Decimal::ZERO
    }
}

/// Immutable record of one position reduction or closure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,

    /// Quantity closed by this event, not the position's total
    pub quantity: Decimal,

    pub leverage: u32,

    /// Margin released by this event
    pub margin: Decimal,

    pub realized_pnl: Decimal,
    pub note: Option<String>,
    pub closed_at: DateTime<Utc>,
}
