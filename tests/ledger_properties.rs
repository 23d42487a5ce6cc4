//! Ledger and close-arithmetic invariants
//!
//! Property tests for the guarantees the wallet ledger must hold under any
//! sequence of operations: balances never go negative, reserve/unreserve is
//! exactly conservative, and a position close never refunds more than the
//! released margin plus its gain.

mod common;

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use papertrade::ledger;
use papertrade::models::{Position, PositionSide, WalletKind};
use papertrade::services::futures::PositionCloser;
use papertrade::store::Store;

use common::{fund, quiet_broadcaster, warm_cache};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn seeded_position(user_id: Uuid, entry_price: Decimal) -> Position {
    Position {
        id: Uuid::new_v4(),
        user_id,
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        quantity: dec!(0.02),
        entry_price,
        leverage: 10,
        margin: dec!(100),
        liquidation_price: Decimal::ZERO,
        tp_price: Decimal::ZERO,
        tp_quantity: Decimal::ZERO,
        sl_price: Decimal::ZERO,
        sl_quantity: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

proptest! {
    /// No sequence of ledger verbs, successful or rejected, may ever leave
    /// a balance record negative.
    #[test]
    fn balances_never_go_negative(
        ops in proptest::collection::vec((0u8..4u8, 1i64..1_000_000i64), 1..40),
    ) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let store = Store::new();
            let user = Uuid::new_v4();

            for (verb, raw) in ops {
                let amount = Decimal::new(raw, 2);
                let mut tx = store.begin().await;
                let outcome = match verb {
                    0 => ledger::receive(&mut tx, user, WalletKind::Spot, "USDT", amount),
                    1 => ledger::spend(&mut tx, user, WalletKind::Spot, "USDT", amount),
                    2 => ledger::reserve(&mut tx, user, WalletKind::Spot, "USDT", amount),
                    _ => ledger::unreserve(&mut tx, user, WalletKind::Spot, "USDT", amount),
                };
                match outcome {
                    Ok(_) => tx.commit(),
                    Err(_) => drop(tx),
                }

                if let Some(record) = store.balance(user, WalletKind::Spot, "USDT").await {
                    prop_assert!(record.available >= Decimal::ZERO);
                    prop_assert!(record.reserved >= Decimal::ZERO);
                }
            }
            Ok(())
        });
        result?;
    }

    /// Reserving and then releasing the same amount restores both fields of
    /// the record exactly, not just approximately.
    #[test]
    fn reserve_then_unreserve_is_exact(
        funded in 1i64..1_000_000i64,
        held_fraction in 1u32..=100u32,
    ) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let store = Store::new();
            let user = Uuid::new_v4();
            let funded = Decimal::new(funded, 2);
            let held = funded * Decimal::from(held_fraction) / dec!(100);
            fund(&store, user, WalletKind::Futures, "USDC", funded).await;

            let before = store.balance(user, WalletKind::Futures, "USDC").await.unwrap();

            let mut tx = store.begin().await;
            ledger::reserve(&mut tx, user, WalletKind::Futures, "USDC", held).unwrap();
            ledger::unreserve(&mut tx, user, WalletKind::Futures, "USDC", held).unwrap();
            tx.commit();

            let after = store.balance(user, WalletKind::Futures, "USDC").await.unwrap();
            prop_assert_eq!(before.available, after.available);
            prop_assert_eq!(before.reserved, after.reserved);
            Ok(())
        });
        result?;
    }

    /// A close refunds `max(0, released margin + PnL)`: what reaches the
    /// wallet never exceeds released margin plus the price gain, and the
    /// released margin is exactly proportional to the closed quantity.
    #[test]
    fn close_refund_honors_the_floor_and_the_proportion(
        entry in 1_000i64..100_000i64,
        exit in 1_000i64..100_000i64,
        closed_bps in 1u32..=10_000u32,
    ) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let store = Store::new();
            let user = Uuid::new_v4();
            let entry = Decimal::from(entry);
            let exit = Decimal::from(exit);
            let position = seeded_position(user, entry);

            let mut tx = store.begin().await;
            tx.put_position(position.clone());
            tx.commit();

            let closer = PositionCloser::new(
                store.clone(),
                warm_cache(&[]),
                quiet_broadcaster(&store),
            );
            let closed = position.quantity * Decimal::from(closed_bps) / dec!(10000);
            let outcome = closer
                .close(position.id, exit, Some(closed))
                .await
                .unwrap()
                .unwrap();

            let expected_released = closed / position.quantity * position.margin;
            let expected_pnl = closed * (exit - entry);
            prop_assert_eq!(outcome.margin_released, expected_released);
            prop_assert_eq!(outcome.realized_pnl, expected_pnl);
            prop_assert_eq!(
                outcome.refund,
                (expected_released + expected_pnl).max(Decimal::ZERO)
            );

            // the wallet received exactly the refund, nothing else
            let credited = store
                .balance(user, WalletKind::Futures, "USDT")
                .await
                .map(|record| record.available)
                .unwrap_or(Decimal::ZERO);
            prop_assert_eq!(credited, outcome.refund);

            // released and remaining margin always account for the whole
            match outcome.remaining {
                Some(rest) => {
                    prop_assert_eq!(rest.margin + outcome.margin_released, position.margin);
                    prop_assert_eq!(rest.quantity + outcome.closed_quantity, position.quantity);
                }
                None => prop_assert_eq!(outcome.margin_released, position.margin),
            }
            Ok(())
        });
        result?;
    }

    /// Any series of partial closes drains the position's margin exactly
    /// once; the history rows and the remainder always sum back to it.
    #[test]
    fn partial_closes_conserve_margin(
        cuts in proptest::collection::vec(1u32..=4_000u32, 1..6),
    ) {
        let result: Result<(), TestCaseError> = runtime().block_on(async {
            let store = Store::new();
            let user = Uuid::new_v4();
            let position = seeded_position(user, dec!(50000));

            let mut tx = store.begin().await;
            tx.put_position(position.clone());
            tx.commit();

            let closer = PositionCloser::new(
                store.clone(),
                warm_cache(&[]),
                quiet_broadcaster(&store),
            );
            for cut_bps in cuts {
                let closed = position.quantity * Decimal::from(cut_bps) / dec!(10000);
                if closer.close(position.id, dec!(50000), Some(closed)).await.unwrap().is_none() {
                    break;
                }
            }

            let released: Decimal = store
                .recent_history(user, 50)
                .await
                .iter()
                .map(|row| row.margin)
                .sum();
            let remaining = store
                .position(position.id)
                .await
                .map(|p| p.margin)
                .unwrap_or(Decimal::ZERO);
            prop_assert_eq!(released + remaining, position.margin);
            Ok(())
        });
        result?;
    }
}
