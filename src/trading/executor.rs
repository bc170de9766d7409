//! Order execution pipeline: submission, retries, partial fills, ledger updates.
//!
//! The pipeline is the only writer of the self account [`Ledger`]. Every fill
//! the sink reports is applied as it arrives, so a FAILED order leaves the
//! ledger exactly as it was.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::{FillStatus, OrderRequest, OrderSink, SinkError, SinkFill};
use crate::models::{FillEffect, OrderStatus, Position, ReplicationOrder, TradeSide};

use super::RetryConfig;

/// Cash and positions of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    cash: Decimal,
    positions: HashMap<String, Position>,
}

impl Ledger {
    pub fn new(cash: Decimal) -> Self {
        Self {
            cash,
            positions: HashMap::new(),
        }
    }

    /// Rebuild a ledger from restored cash and holdings.
    pub fn from_parts(cash: Decimal, positions: impl IntoIterator<Item = Position>) -> Self {
        Self {
            cash,
            positions: positions
                .into_iter()
                .map(|p| (p.market_id.clone(), p))
                .collect(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, market_id: &str) -> Option<&Position> {
        self.positions.get(market_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Apply one fill to cash and the market's position.
    pub fn apply_fill(&mut self, market_id: &str, side: TradeSide, size: Decimal, price: Decimal) -> FillEffect {
        if size <= Decimal::ZERO {
            return FillEffect::default();
        }
        self.cash -= side.sign() * size * price;
        self.positions
            .entry(market_id.to_string())
            .or_insert_with(|| Position::new(market_id))
            .apply_fill(side, size, price)
    }

    /// Open positions valued at `marks`, falling back to entry price.
    pub fn open_value(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.positions
            .values()
            .map(|p| p.value_at(marks.get(&p.market_id).copied().unwrap_or(p.avg_entry_price)))
            .sum()
    }

    pub fn equity(&self, marks: &HashMap<String, Decimal>) -> Decimal {
        self.cash + self.open_value(marks)
    }
}

/// Inconsistency between a sink fill and the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillAnomaly {
    /// Reported status disagrees with the filled size
    StatusMismatch(FillStatus),
    /// Average fill price is worse than the order's limit
    PriceBeyondLimit,
}

impl fmt::Display for FillAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillAnomaly::StatusMismatch(status) => write!(f, "status {:?} disagrees with filled size", status),
            FillAnomaly::PriceBeyondLimit => f.write_str("fill price beyond limit"),
        }
    }
}

/// Check a fill against its request.
pub fn fill_anomalies(request: &OrderRequest, fill: &SinkFill) -> Vec<FillAnomaly> {
    let mut anomalies = Vec::new();

    let consistent = match fill.status {
        FillStatus::Filled => fill.filled_size >= request.size,
        FillStatus::PartiallyFilled => fill.filled_size > Decimal::ZERO && fill.filled_size < request.size,
        FillStatus::Unfilled => fill.filled_size.is_zero(),
    };
    if !consistent {
        anomalies.push(FillAnomaly::StatusMismatch(fill.status));
    }

    if let Some(limit) = request.price_limit {
        let beyond = match request.side {
            TradeSide::Buy => fill.avg_fill_price > limit,
            TradeSide::Sell => fill.avg_fill_price < limit,
        };
        if fill.filled_size > Decimal::ZERO && beyond {
            anomalies.push(FillAnomaly::PriceBeyondLimit);
        }
    }

    anomalies
}

/// Bounded submission attempts with exponential backoff between them.
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_backoff())
            .with_max_interval(config.max_backoff())
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        Self {
            attempts: 0,
            max_attempts: config.max_retry_attempts.saturating_add(1),
            backoff,
        }
    }

    /// Count a submission. Returns the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.backoff.next_backoff()
    }
}

/// Outcome of executing one replication order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub order: ReplicationOrder,

    /// Signed change in the market's net size
    pub position_delta: Decimal,

    /// Signed change in cash
    pub cash_delta: Decimal,

    /// P&L realized by the fills
    pub realized_pnl: Decimal,

    /// Round trips closed by the fills, with their P&L
    pub closed_round_trips: Vec<Decimal>,
}

impl ExecutionReport {
    fn untouched(order: ReplicationOrder) -> Self {
        Self {
            order,
            position_delta: Decimal::ZERO,
            cash_delta: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            closed_round_trips: Vec::new(),
        }
    }
}

/// Live execution against an order sink.
pub struct ExecutionPipeline {
    sink: Arc<dyn OrderSink>,
    retry: RetryConfig,
    ledger: Ledger,
}

impl ExecutionPipeline {
    pub fn new(sink: Arc<dyn OrderSink>, retry: RetryConfig, ledger: Ledger) -> Self {
        Self { sink, retry, ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Best price the sink can quote, if any.
    pub async fn quote(&self, market_id: &str, side: TradeSide) -> Option<Decimal> {
        match self.sink.best_price(market_id, side).await {
            Ok(price) => price,
            Err(e) => {
                debug!(market = %market_id, error = %e, "No quote available");
                None
            }
        }
    }

    /// Drive `order` to a terminal state.
    pub async fn execute(&mut self, mut order: ReplicationOrder) -> ExecutionReport {
        if order.status != OrderStatus::Pending {
            return ExecutionReport::untouched(order);
        }

        let mut report = ExecutionReport::untouched(order.clone());
        let mut retry = RetryState::new(&self.retry);

        loop {
            order.attempts = retry.begin_attempt();
            let request = OrderRequest {
                market_id: order.market_id.clone(),
                side: order.side,
                size: order.remaining(),
                price_limit: order.price_limit,
            };

            let result = match tokio::time::timeout(self.retry.submit_timeout(), self.sink.submit(&request)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Transient(format!(
                    "submission timed out after {:?}",
                    self.retry.submit_timeout()
                ))),
            };

            match result {
                Ok(fill) => {
                    if order.status == OrderStatus::Pending {
                        transition(&mut order, OrderStatus::Submitted);
                    }

                    for anomaly in fill_anomalies(&request, &fill) {
                        warn!(
                            trade_id = %order.source_trade_id,
                            market = %order.market_id,
                            side = %order.side,
                            requested = %request.size,
                            filled = %fill.filled_size,
                            avg_fill_price = %fill.avg_fill_price,
                            price_limit = ?request.price_limit,
                            anomaly = %anomaly,
                            "Suspicious fill reported by sink"
                        );
                    }

                    let filled = fill.filled_size.min(order.remaining());
                    if filled > Decimal::ZERO {
                        self.apply(&mut order, &mut report, filled, fill.avg_fill_price);
                    }

                    if order.remaining().is_zero() {
                        transition(&mut order, OrderStatus::Filled);
                        break;
                    }
                    debug!(
                        trade_id = %order.source_trade_id,
                        filled = %order.filled_size,
                        remaining = %order.remaining(),
                        "Order not fully filled"
                    );
                }
                Err(SinkError::Rejected(reason)) => {
                    order.last_error = Some(reason);
                    let terminal = if order.filled_size > Decimal::ZERO {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Failed
                    };
                    transition(&mut order, terminal);
                    break;
                }
                Err(SinkError::Transient(reason)) => {
                    warn!(
                        trade_id = %order.source_trade_id,
                        attempt = order.attempts,
                        error = %reason,
                        "Transient submission failure"
                    );
                    order.last_error = Some(reason);
                }
            }

            match retry.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    let terminal = if order.filled_size > Decimal::ZERO {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Failed
                    };
                    transition(&mut order, terminal);
                    break;
                }
            }
        }

        if order.status == OrderStatus::Failed {
            error!(
                trade_id = %order.source_trade_id,
                market = %order.market_id,
                side = %order.side,
                size = %order.size,
                price_limit = ?order.price_limit,
                attempts = order.attempts,
                error = ?order.last_error,
                "Replication order failed"
            );
        }

        report.order = order;
        report
    }

    fn apply(&mut self, order: &mut ReplicationOrder, report: &mut ExecutionReport, size: Decimal, price: Decimal) {
        let effect = self.ledger.apply_fill(&order.market_id, order.side, size, price);
        order.record_fill(size, price);

        report.position_delta += order.side.sign() * size;
        report.cash_delta -= order.side.sign() * size * price;
        report.realized_pnl += effect.realized_pnl;
        report.closed_round_trips.extend(effect.closed_round_trip);
    }
}

fn transition(order: &mut ReplicationOrder, status: OrderStatus) {
    info!(
        trade_id = %order.source_trade_id,
        from = %order.status,
        to = %status,
        filled = %order.filled_size,
        attempts = order.attempts,
        "Order status"
    );
    order.status = status;
}
