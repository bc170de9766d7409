//! Data models for trade events, positions, and replication orders.

mod order;
mod position;
mod trade;

pub use order::{Decision, OrderStatus, ReplicationOrder, SkipReason};
pub use position::{FillEffect, Position};
pub use trade::{normalize_address, TradeEvent, TradeSide, Wallet, WalletRole};

#[cfg(test)]
pub(crate) use trade::fixtures;
