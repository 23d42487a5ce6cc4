//! Paper trading engine
//!
//! Simulated spot and leveraged futures trading against live market
//! prices: an in-process transactional store, a shared wallet ledger,
//! order services, the scheduled futures engine and the account event
//! broadcaster. No real funds move anywhere.

pub mod config;
pub mod ledger;
pub mod models;
pub mod services;
pub mod store;
pub mod ws;
