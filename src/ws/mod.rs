//! Account event push channel

pub mod broadcaster;

pub use broadcaster::{AccountEvent, AccountEventBroadcaster, OrderPayload};
