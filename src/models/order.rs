//! Order models
//!
//! Spot and futures orders share the status lifecycle but carry different
//! payloads: spot orders hold both legs of the swap so reserve/release
//! amounts stay exact, futures orders hold leverage and the margin actually
//! deducted at placement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::symbol::QuoteAsset;

/// Order status, terminal-once: pending orders move to exactly one of the
/// terminal states and never change again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Market or limit execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            _ => Err(format!("Invalid order type: {}", s)),
        }
    }
}

/// Spot order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpotSide {
    Buy,
    Sell,
}

impl fmt::Display for SpotSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpotSide::Buy => write!(f, "buy"),
            SpotSide::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for SpotSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(SpotSide::Buy),
            "sell" => Ok(SpotSide::Sell),
            _ => Err(format!("Invalid spot side: {}", s)),
        }
    }
}

/// Futures position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn is_long(&self) -> bool {
        matches!(self, PositionSide::Long)
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            _ => Err(format!("Invalid position side: {}", s)),
        }
    }
}

/// A spot order
///
/// Both swap legs are stored at placement time so fills and cancellations
/// move exactly the amounts that were held, independent of later prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: QuoteAsset,
    pub side: SpotSide,
    pub order_type: OrderType,

    /// Quantity of the base asset
    pub quantity_base: Decimal,

    /// Limit price for limit orders, execution price for market orders
    pub price_quote: Decimal,

    /// Quote-side notional (quantity × price), the amount held for buys
    pub quote_amount: Decimal,

    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A futures order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub order_type: OrderType,

    /// Quantity of the base asset (notional / execution price)
    pub quantity: Decimal,

    pub leverage: u32,

    /// Margin actually deducted at placement; released verbatim on
    /// cancel, pulled out of reserve verbatim on fill
    pub margin_reserved: Decimal,

    /// Limit price for limit orders, execution price for market orders
    pub price: Decimal,

    /// Fill price once the order reaches `Filled`, zero before that
    pub average_price: Decimal,

    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FuturesOrder {
    /// Whether a price crossing the limit should fill this order
    pub fn crosses(&self, current_price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => current_price <= self.price,
            PositionSide::Short => current_price >= self.price,
        }
    }
}
