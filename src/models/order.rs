//! Replication orders and the decisions that produce them.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeSide;

/// Lifecycle of a replication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Failed,
    Skipped,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trade was not replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    /// Best available price is outside the slippage tolerance
    SlippageExceeded,
    /// SELL with nothing held in the market
    InsufficientPosition,
    /// BUY notional exceeds the self balance
    InsufficientBalance,
    /// No scale override and no usable target balance
    TargetBalanceUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            SkipReason::InsufficientPosition => "INSUFFICIENT_POSITION",
            SkipReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            SkipReason::TargetBalanceUnavailable => "TARGET_BALANCE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sized order derived from an observed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOrder {
    /// Id of the trade that triggered this order
    pub source_trade_id: String,

    pub market_id: String,

    pub side: TradeSide,

    /// Requested size in outcome tokens
    pub size: Decimal,

    /// Worst acceptable price (BUY ceiling, SELL floor)
    pub price_limit: Option<Decimal>,

    pub status: OrderStatus,

    /// Tokens filled so far
    #[serde(default)]
    pub filled_size: Decimal,

    /// Volume-weighted fill price
    #[serde(default)]
    pub avg_fill_price: Option<Decimal>,

    /// Submissions made to the sink
    #[serde(default)]
    pub attempts: u32,

    /// Set on SKIPPED orders
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,

    /// Last sink error, kept for diagnosing FAILED orders
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ReplicationOrder {
    pub fn new(
        source_trade_id: impl Into<String>,
        market_id: impl Into<String>,
        side: TradeSide,
        size: Decimal,
        price_limit: Option<Decimal>,
    ) -> Self {
        Self {
            source_trade_id: source_trade_id.into(),
            market_id: market_id.into(),
            side,
            size,
            price_limit,
            status: OrderStatus::Pending,
            filled_size: Decimal::ZERO,
            avg_fill_price: None,
            attempts: 0,
            skip_reason: None,
            last_error: None,
        }
    }

    /// Record of a trade that was deliberately not replicated.
    pub fn skipped(
        source_trade_id: impl Into<String>,
        market_id: impl Into<String>,
        side: TradeSide,
        reason: SkipReason,
    ) -> Self {
        Self {
            status: OrderStatus::Skipped,
            skip_reason: Some(reason),
            ..Self::new(source_trade_id, market_id, side, Decimal::ZERO, None)
        }
    }

    pub fn remaining(&self) -> Decimal {
        (self.size - self.filled_size).max(Decimal::ZERO)
    }

    /// Fold a fill into the running totals.
    pub fn record_fill(&mut self, size: Decimal, price: Decimal) {
        if size <= Decimal::ZERO {
            return;
        }
        let prior_cost = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_size;
        self.filled_size += size;
        self.avg_fill_price = Some((prior_cost + size * price) / self.filled_size);
    }
}

/// Output of the decision engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Replicate(ReplicationOrder),
    Skip(SkipReason),
}

impl Decision {
    pub fn order(&self) -> Option<&ReplicationOrder> {
        match self {
            Decision::Replicate(order) => Some(order),
            Decision::Skip(_) => None,
        }
    }
}
