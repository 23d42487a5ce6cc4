//! Balance records
//!
//! One record per (user, wallet, asset). Records are only ever mutated
//! through the ledger primitives, which keep both fields non-negative and
//! snap sub-dust residue to exactly zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which of the two segregated wallets a balance lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletKind {
    Spot,
    Futures,
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletKind::Spot => write!(f, "spot"),
            WalletKind::Futures => write!(f, "futures"),
        }
    }
}

impl std::str::FromStr for WalletKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(WalletKind::Spot),
            "futures" => Ok(WalletKind::Futures),
            _ => Err(format!("Invalid wallet kind: {}", s)),
        }
    }
}

/// Positive balances below this are rounding residue and snap to zero
pub fn dust_threshold() -> Decimal {
    Decimal::new(1, 10) // 1e-10
}

/// A user's holding of one asset in one wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub user_id: Uuid,
    pub wallet: WalletKind,
    pub asset: String,

    /// Spendable funds
    pub available: Decimal,

    /// Funds held against pending limit orders
    pub reserved: Decimal,

    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// Fresh zero-balance record, created lazily on first movement
    pub fn empty(user_id: Uuid, wallet: WalletKind, asset: &str) -> Self {
        Self {
            user_id,
            wallet,
            asset: asset.to_string(),
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }

    /// Snap positive sub-dust residue on either field to exactly zero
    pub fn snap_dust(&mut self) {
        let dust = dust_threshold();
        if self.available > Decimal::ZERO && self.available < dust {
            self.available = Decimal::ZERO;
        }
        if self.reserved > Decimal::ZERO && self.reserved < dust {
            self.reserved = Decimal::ZERO;
        }
    }
}
