//! Trading pair symbols
//!
//! Symbols arrive as raw strings ("BTCUSDT", "btc_usdt"); everything past the
//! request boundary works with a parsed [`SymbolPair`] so the quote asset is
//! known and validated exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote assets the venue settles in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteAsset {
    Usdt,
    Usdc,
}

impl QuoteAsset {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteAsset::Usdt => "USDT",
            QuoteAsset::Usdc => "USDC",
        }
    }
}

/// Whether an asset string is one of the supported stables
pub fn is_stable(asset: &str) -> bool {
    asset == "USDT" || asset == "USDC"
}

impl fmt::Display for QuoteAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuoteAsset {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USDT" => Ok(QuoteAsset::Usdt),
            "USDC" => Ok(QuoteAsset::Usdc),
            other => Err(SymbolError::UnsupportedQuote(other.to_string())),
        }
    }
}

/// Symbol parsing failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("unsupported quote asset: {0}")]
    UnsupportedQuote(String),

    #[error("invalid symbol: {0}")]
    Invalid(String),
}

/// A validated trading pair
///
/// The canonical form is flat uppercase ("BTCUSDT"); underscore separators
/// used by futures tickers are accepted and normalized away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolPair {
    symbol: String,
    base: String,
    quote: QuoteAsset,
}

impl SymbolPair {
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let symbol = raw.trim().replace('_', "").to_uppercase();

        let (base, quote) = if let Some(base) = symbol.strip_suffix("USDT") {
            (base, QuoteAsset::Usdt)
        } else if let Some(base) = symbol.strip_suffix("USDC") {
            (base, QuoteAsset::Usdc)
        } else {
            return Err(SymbolError::UnsupportedQuote(raw.to_string()));
        };

        if base.is_empty() || !base.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SymbolError::Invalid(raw.to_string()));
        }

        Ok(Self {
            base: base.to_string(),
            quote,
            symbol,
        })
    }

    /// Canonical symbol string ("BTCUSDT")
    pub fn as_str(&self) -> &str {
        &self.symbol
    }

    /// Base asset ("BTC")
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote asset the pair settles in
    pub fn quote(&self) -> QuoteAsset {
        self.quote
    }
}

impl fmt::Display for SymbolPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}
