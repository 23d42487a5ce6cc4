//! Money movement primitives
//!
//! Every balance mutation in the venue goes through one of four verbs:
//! spend, receive, reserve, unreserve. Each verb runs against an open
//! [`StoreTx`] so the caller decides the atomic unit; the verb itself
//! validates the amount, upserts the record on first use, enforces
//! non-negativity and snaps sub-dust residue back to exactly zero.
//!
//! Wallet-to-wallet transfers are built from the same verbs and own their
//! transaction.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::models::{is_stable, BalanceRecord, WalletKind};
use crate::store::{Store, StoreTx};

/// Slack for funds checks on the margin path. Notional/leverage chains
/// produce long decimal fractions; a shortfall under this counts as funded.
pub fn funds_tolerance() -> Decimal {
    Decimal::new(1, 8)
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Insufficient {asset} balance")]
    InsufficientFunds { asset: String },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
}

fn positive(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

fn store_updated(tx: &mut StoreTx, mut record: BalanceRecord) -> BalanceRecord {
    record.snap_dust();
    record.updated_at = Utc::now();
    tx.put_balance(record.clone());
    record
}

/// `available -= amount`, failing if the wallet cannot cover it
pub fn spend(
    tx: &mut StoreTx,
    user_id: Uuid,
    wallet: WalletKind,
    asset: &str,
    amount: Decimal,
) -> Result<BalanceRecord, LedgerError> {
    positive(amount)?;
    let mut record = tx.balance_or_default(user_id, wallet, asset);
    if record.available < amount {
        return Err(LedgerError::InsufficientFunds {
            asset: asset.to_string(),
        });
    }
    record.available -= amount;
    Ok(store_updated(tx, record))
}

/// `available += amount`
pub fn receive(
    tx: &mut StoreTx,
    user_id: Uuid,
    wallet: WalletKind,
    asset: &str,
    amount: Decimal,
) -> Result<BalanceRecord, LedgerError> {
    positive(amount)?;
    let mut record = tx.balance_or_default(user_id, wallet, asset);
    record.available += amount;
    Ok(store_updated(tx, record))
}

/// Move `amount` from available into reserved, failing if uncovered
pub fn reserve(
    tx: &mut StoreTx,
    user_id: Uuid,
    wallet: WalletKind,
    asset: &str,
    amount: Decimal,
) -> Result<BalanceRecord, LedgerError> {
    positive(amount)?;
    let mut record = tx.balance_or_default(user_id, wallet, asset);
    if record.available < amount {
        return Err(LedgerError::InsufficientFunds {
            asset: asset.to_string(),
        });
    }
    record.available -= amount;
    record.reserved += amount;
    Ok(store_updated(tx, record))
}

/// Release `amount` from reserved back into available
///
/// Reserved is clamped at zero so a release that exceeds the outstanding
/// reservation can never drive it negative.
pub fn unreserve(
    tx: &mut StoreTx,
    user_id: Uuid,
    wallet: WalletKind,
    asset: &str,
    amount: Decimal,
) -> Result<BalanceRecord, LedgerError> {
    positive(amount)?;
    let mut record = tx.balance_or_default(user_id, wallet, asset);
    record.reserved = (record.reserved - amount).max(Decimal::ZERO);
    record.available += amount;
    Ok(store_updated(tx, record))
}

/// Updated source and destination records after a wallet transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub from: BalanceRecord,
    pub to: BalanceRecord,
}

/// Move a stablecoin between the user's spot and futures wallets
///
/// Spend and receive run in one transaction, so a failed leg leaves both
/// wallets untouched.
pub async fn transfer(
    store: &Store,
    user_id: Uuid,
    asset: &str,
    from: WalletKind,
    to: WalletKind,
    amount: Decimal,
) -> Result<TransferOutcome, LedgerError> {
    if !is_stable(asset) {
        return Err(LedgerError::InvalidTransfer(format!(
            "asset {asset} is not transferable"
        )));
    }
    if from == to {
        return Err(LedgerError::InvalidTransfer(
            "source and destination wallets are the same".to_string(),
        ));
    }
    positive(amount)?;

    let mut tx = store.begin().await;
    let source = spend(&mut tx, user_id, from, asset, amount)?;
    let dest = receive(&mut tx, user_id, to, asset, amount)?;
    tx.commit();

    debug!(%user_id, asset, %amount, %from, %to, "wallet transfer settled");
    Ok(TransferOutcome {
        from: source,
        to: dest,
    })
}
