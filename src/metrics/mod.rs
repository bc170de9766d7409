//! Performance metrics shared by backtests and wallet ranking.

mod calculator;

pub use calculator::{Drawdown, MetricsCalculator, RoundTripStats};
