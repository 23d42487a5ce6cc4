//! Leveraged futures: order placement, position lifecycle, background engine
//!
//! [`orders::FuturesOrderService`] handles placement, cancellation and
//! TP/SL target updates. [`closer::PositionCloser`] owns every path that
//! reduces or removes a position. [`engine::FuturesEngine`] is the
//! scheduled loop driving limit fills, target triggers and liquidations.

pub mod closer;
pub mod engine;
pub mod orders;

pub use closer::{CloseOutcome, PositionCloser};
pub use engine::FuturesEngine;
pub use orders::{FuturesOrderService, TargetUpdate};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::models::{PositionSide, SymbolError};

#[derive(Debug, thiserror::Error)]
pub enum FuturesError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error("Insufficient {asset} balance")]
    InsufficientFunds { asset: String },

    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("No open position for {0}")]
    PositionNotFound(String),
}

impl From<LedgerError> for FuturesError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { asset } => FuturesError::InsufficientFunds { asset },
            other => FuturesError::Validation(other.to_string()),
        }
    }
}

/// Liquidation price for positions opened or merged at placement time.
/// The margin distance carries a 0.9 buffer.
pub(crate) fn placement_liquidation_price(
    side: PositionSide,
    entry_price: Decimal,
    margin: Decimal,
    quantity: Decimal,
) -> Decimal {
    let distance = dec!(0.9) * margin / quantity;
    match side {
        PositionSide::Long => entry_price - distance,
        PositionSide::Short => entry_price + distance,
    }
}

/// Liquidation price used by the scheduled limit-fill pass. Unlike the
/// placement formula, the margin distance here carries no buffer.
pub(crate) fn fill_liquidation_price(
    side: PositionSide,
    entry_price: Decimal,
    margin: Decimal,
    quantity: Decimal,
) -> Decimal {
    let distance = margin / quantity;
    match side {
        PositionSide::Long => entry_price - distance,
        PositionSide::Short => entry_price + distance,
    }
}
