//! Performance metrics over an equity curve and closed round trips: drawdown,
//! win rate, profit factor, Sharpe ratio.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

/// Peak-to-trough decline of an equity curve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Drawdown {
    /// Largest absolute decline
    pub absolute: Decimal,
    /// Largest decline as a fraction of the running peak
    pub pct: f64,
    /// Highest equity observed
    pub peak: Decimal,
}

/// Win/loss statistics over closed round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundTripStats {
    pub closed: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: f64,
}

/// Calculator for computing performance metrics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Maximum drawdown of `equity`, measured from the first sample onward.
    pub fn max_drawdown(equity: &[Decimal]) -> Drawdown {
        let Some(&first) = equity.first() else {
            return Drawdown::default();
        };

        let mut peak = first;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for &value in equity {
            if value > peak {
                peak = value;
            }

            let dd = peak - value;
            if dd > max_dd {
                max_dd = dd;
            }

            if peak > Decimal::ZERO {
                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        Drawdown {
            absolute: max_dd,
            pct: max_dd_pct,
            peak,
        }
    }

    /// Win rate and payoff statistics. A zero-P&L trip counts as a loss.
    pub fn round_trips(pnls: &[Decimal]) -> RoundTripStats {
        if pnls.is_empty() {
            return RoundTripStats::default();
        }

        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) = pnls.iter().copied().partition(|p| *p > Decimal::ZERO);

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        let avg_win = if wins.is_empty() {
            Decimal::ZERO
        } else {
            gross_profit / Decimal::from(wins.len() as u64)
        };
        let avg_loss = if losses.is_empty() {
            Decimal::ZERO
        } else {
            gross_loss / Decimal::from(losses.len() as u64)
        };

        let profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0)
        } else {
            0.0
        };

        RoundTripStats {
            closed: pnls.len(),
            wins: wins.len(),
            losses: losses.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win,
            avg_loss,
            profit_factor,
        }
    }

    /// Sharpe ratio of per-sample equity returns (risk-free rate 0, not annualized).
    pub fn sharpe_ratio(equity: &[Decimal]) -> f64 {
        let returns: Vec<f64> = equity
            .windows(2)
            .filter_map(|w| {
                let prev = w[0].to_f64()?;
                let curr = w[1].to_f64()?;
                (prev > 0.0).then(|| (curr - prev) / prev)
            })
            .collect();

        if returns.len() < 2 {
            return 0.0;
        }

        let mean = returns.clone().mean();
        let std_dev = returns.std_dev();

        if std_dev > 0.0 && std_dev.is_finite() {
            mean / std_dev
        } else {
            0.0
        }
    }
}
