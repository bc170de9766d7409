//! Backtest simulator for screening candidate wallets.
//!
//! Replays a wallet's historical trades through the same decision engine the
//! live runner uses, against an in-memory ledger:
//! - Fills are instant and complete at the decided price
//! - Open positions are marked at the last price seen for their market
//! - Results are deterministic for identical inputs
//!
//! The simulator performs no I/O; callers fetch history first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics::MetricsCalculator;
use crate::models::{Decision, TradeEvent, TradeSide};
use crate::trading::{self, ConfigError, DecisionEngine, DecisionInput, Ledger, PolicyConfig};

/// Backtesting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Starting cash of the simulated self account
    pub starting_balance: Decimal,

    /// Sizing and slippage policy
    pub policy: PolicyConfig,

    /// Assumed target wallet balance when no scale override is set
    pub target_balance: Option<Decimal>,

    /// Simulated adverse price move on every fill (0.0 to 1.0)
    pub simulated_slippage: Decimal,

    /// Number of historical trades to fetch per wallet
    pub lookback_trades: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            starting_balance: dec!(10000),
            policy: PolicyConfig::default(),
            target_balance: None,
            simulated_slippage: Decimal::ZERO,
            lookback_trades: 500,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        trading::positive("starting_balance", self.starting_balance)?;
        trading::non_negative("simulated_slippage", self.simulated_slippage)?;
        if let Some(target) = self.target_balance {
            trading::positive("target_balance", target)?;
        }
        self.policy.validate()
    }
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("backtest cancelled after {processed} events")]
    Cancelled { processed: usize },

    #[error("no trade history for {0}")]
    EmptyHistory(String),

    #[error("invalid backtest config: {0}")]
    Config(#[from] ConfigError),
}

/// Backtest results summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub wallet: String,

    /// Non-skipped decisions applied to the ledger
    pub total_trades_replicated: usize,

    /// Decisions that skipped the trade
    pub skipped_trades: usize,

    /// Realized P&L plus open positions marked at last price
    pub realized_pnl: Decimal,

    /// Fraction of closed round trips with positive P&L
    pub win_rate: f64,

    pub closed_round_trips: usize,

    pub profit_factor: f64,

    /// Largest peak-to-trough equity decline
    pub max_drawdown: Decimal,

    /// Same decline as a fraction of the peak
    pub max_drawdown_pct: f64,

    /// Sharpe ratio of per-event equity returns
    pub sharpe_ratio: f64,

    pub starting_balance: Decimal,

    /// Cash plus open positions marked at last price
    pub final_balance: Decimal,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BacktestResult {
    /// Total return as a fraction of the starting balance.
    pub fn return_pct(&self) -> Decimal {
        if self.starting_balance.is_zero() {
            return Decimal::ZERO;
        }
        (self.final_balance - self.starting_balance) / self.starting_balance
    }
}

impl std::fmt::Display for BacktestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Wallet: {}", self.wallet)?;
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            writeln!(f, "Period: {} to {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))?;
        }
        writeln!(f)?;
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.starting_balance)?;
        writeln!(f, "Final:       ${:.2}", self.final_balance)?;
        writeln!(f, "P&L:         ${:.2}", self.realized_pnl)?;
        writeln!(f, "Return:      {:.2}%", self.return_pct() * dec!(100))?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(
            f,
            "Replicated:  {} ({} skipped)",
            self.total_trades_replicated, self.skipped_trades
        )?;
        writeln!(
            f,
            "Round Trips: {} ({:.1}% won)",
            self.closed_round_trips,
            self.win_rate * 100.0
        )?;
        writeln!(f, "Profit Factor: {:.2}", self.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(
            f,
            "Max Drawdown: ${:.2} ({:.2}%)",
            self.max_drawdown,
            self.max_drawdown_pct * 100.0
        )?;
        writeln!(f, "Sharpe Ratio: {:.2}", self.sharpe_ratio)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting engine.
#[derive(Debug, Clone)]
pub struct Simulator {
    config: BacktestConfig,
    engine: DecisionEngine,
}

impl Simulator {
    /// Create a new simulator, rejecting invalid configuration.
    pub fn new(config: BacktestConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        let engine = DecisionEngine::new(config.policy.clone());
        Ok(Self { config, engine })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `history` for `wallet` to completion.
    pub fn simulate(&self, wallet: &str, history: &[TradeEvent]) -> Result<BacktestResult, BacktestError> {
        self.simulate_until(wallet, history, &AtomicBool::new(false))
    }

    /// Replay `history`, stopping between events once `cancel` is set.
    pub fn simulate_until(
        &self,
        wallet: &str,
        history: &[TradeEvent],
        cancel: &AtomicBool,
    ) -> Result<BacktestResult, BacktestError> {
        if history.is_empty() {
            return Err(BacktestError::EmptyHistory(wallet.to_string()));
        }

        let mut ordered: Vec<&TradeEvent> = history.iter().collect();
        ordered.sort_by(|a, b| a.replay_order(b));

        info!(wallet = %wallet, events = ordered.len(), "Starting backtest");

        let mut ledger = Ledger::new(self.config.starting_balance);
        let mut marks: HashMap<String, Decimal> = HashMap::new();
        let mut equity_curve = Vec::with_capacity(ordered.len() + 1);
        let mut round_trips = Vec::new();
        let mut replicated = 0usize;
        let mut skipped = 0usize;

        equity_curve.push(ledger.equity(&marks));

        for (processed, event) in ordered.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!(wallet = %wallet, processed, "Backtest cancelled");
                return Err(BacktestError::Cancelled { processed });
            }

            marks.insert(event.market_id.clone(), event.price);

            let fill_price = self.fill_price(event.side, event.price);
            let decision = self.engine.decide(
                event,
                DecisionInput {
                    self_balance: ledger.cash(),
                    target_balance_estimate: self.config.target_balance,
                    self_position: ledger.position(&event.market_id),
                    quote: Some(fill_price),
                },
            );

            match decision {
                Decision::Replicate(order) => {
                    let effect = ledger.apply_fill(&order.market_id, order.side, order.size, fill_price);
                    round_trips.extend(effect.closed_round_trip);
                    replicated += 1;
                }
                Decision::Skip(reason) => {
                    debug!(trade_id = %event.id, reason = %reason, "Trade skipped");
                    skipped += 1;
                }
            }

            equity_curve.push(ledger.equity(&marks));
        }

        let realized_pnl: Decimal = ledger
            .positions()
            .map(|p| {
                let mark = marks.get(&p.market_id).copied().unwrap_or(p.avg_entry_price);
                p.realized_pnl + p.unrealized_at(mark)
            })
            .sum();

        let drawdown = MetricsCalculator::max_drawdown(&equity_curve);
        let trips = MetricsCalculator::round_trips(&round_trips);

        let result = BacktestResult {
            wallet: wallet.to_string(),
            total_trades_replicated: replicated,
            skipped_trades: skipped,
            realized_pnl,
            win_rate: trips.win_rate,
            closed_round_trips: trips.closed,
            profit_factor: trips.profit_factor,
            max_drawdown: drawdown.absolute,
            max_drawdown_pct: drawdown.pct,
            sharpe_ratio: MetricsCalculator::sharpe_ratio(&equity_curve),
            starting_balance: self.config.starting_balance,
            final_balance: ledger.equity(&marks),
            start_time: ordered.first().map(|e| e.timestamp),
            end_time: ordered.last().map(|e| e.timestamp),
        };

        info!(
            wallet = %wallet,
            replicated = result.total_trades_replicated,
            skipped = result.skipped_trades,
            pnl = %result.realized_pnl,
            win_rate = result.win_rate,
            "Backtest complete"
        );

        Ok(result)
    }

    /// Apply simulated slippage to a price.
    fn fill_price(&self, side: TradeSide, price: Decimal) -> Decimal {
        match side {
            TradeSide::Buy => price * (Decimal::ONE + self.config.simulated_slippage),
            TradeSide::Sell => price * (Decimal::ONE - self.config.simulated_slippage),
        }
    }
}

/// Run one history under several policies, in order.
pub fn sweep(
    base: &BacktestConfig,
    policies: &[PolicyConfig],
    wallet: &str,
    history: &[TradeEvent],
) -> Result<Vec<BacktestResult>, BacktestError> {
    policies
        .iter()
        .map(|policy| {
            let config = BacktestConfig {
                policy: policy.clone(),
                ..base.clone()
            };
            Simulator::new(config)?.simulate(wallet, history)
        })
        .collect()
}
