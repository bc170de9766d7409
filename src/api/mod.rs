//! Collaborator contracts the core depends on, plus the adapters shipped here.
//!
//! The core only sees these traits: a trade source for wallet history, an
//! order sink for submissions, a balance source for account values and
//! holdings, and a quote source for top-of-book prices.

mod book_client;
mod data_client;
mod paper_sink;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Position, TradeEvent, TradeSide};

pub use book_client::BookClient;
pub use data_client::DataClient;
pub use paper_sink::PaperSink;

/// Failures fetching trade history.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("trade source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid wallet: {0}")]
    InvalidWallet(String),
}

/// Failures submitting an order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// Terminal: the order parameters cannot be executed
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Retryable network or exchange condition
    #[error("transient sink error: {0}")]
    Transient(String),
}

/// Failures reading an account balance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("balance unavailable: {0}")]
    Unavailable(String),
}

/// Position in a wallet's trade stream handed to the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchCursor {
    /// Return trades at or after this instant; `None` means from the start
    pub since: Option<DateTime<Utc>>,
}

/// Order as handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub market_id: String,
    pub side: TradeSide,
    pub size: Decimal,
    pub price_limit: Option<Decimal>,
}

/// Fill status reported by the sink for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Unfilled,
}

/// Result of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFill {
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub status: FillStatus,
}

/// Source of a wallet's trades.
#[async_trait]
pub trait TradeSource: Send + Sync {
    /// Trades at or after `cursor`, in any order.
    async fn fetch_since(&self, wallet: &str, cursor: FetchCursor) -> Result<Vec<TradeEvent>, SourceError>;
}

/// Destination for replication orders.
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<SinkFill, SinkError>;

    /// Best available price for `side` in `market_id`, when the sink can tell.
    async fn best_price(&self, _market_id: &str, _side: TradeSide) -> Result<Option<Decimal>, SinkError> {
        Ok(None)
    }
}

/// Account balance and holdings lookup.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn get(&self, wallet: &str) -> Result<Decimal, BalanceError>;

    /// Open holdings of `wallet`, when the source can report them.
    async fn positions(&self, _wallet: &str) -> Result<Vec<Position>, BalanceError> {
        Err(BalanceError::Unavailable("holdings not reported by this source".to_string()))
    }
}

/// Read-only top-of-book prices.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Price a `side` order would execute at, if the market has a book.
    async fn best_price(&self, market_id: &str, side: TradeSide) -> Result<Option<Decimal>, SourceError>;
}
