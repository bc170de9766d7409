//! Wallet discovery: rank wallets active in recent market-wide trades.
//!
//! Each wallet's trade count and number of distinct markets are z-scored
//! across the candidates that clear `min_trades`, then blended by weight.
//! The score measures activity, not skill; pair it with a backtest.

use std::collections::{BTreeMap, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::models::TradeEvent;

/// Scoring parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Wallets with fewer trades in the window are ignored
    pub min_trades: usize,
    pub trade_count_weight: f64,
    pub unique_markets_weight: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_trades: 5,
            trade_count_weight: 0.8,
            unique_markets_weight: 0.2,
        }
    }
}

/// Activity summary of one wallet over the scanned window.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletActivity {
    pub wallet: String,
    pub trade_count: usize,
    pub unique_markets: usize,
    /// Sum of trade notionals
    pub volume: Decimal,
    pub activity_score: f64,
}

pub struct WalletScorer {
    config: DiscoveryConfig,
}

impl WalletScorer {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Score every wallet in `trades`, highest score first.
    pub fn score(&self, trades: &[TradeEvent]) -> Vec<WalletActivity> {
        let mut by_wallet: BTreeMap<&str, (usize, HashSet<&str>, Decimal)> = BTreeMap::new();
        for trade in trades {
            let entry = by_wallet.entry(trade.wallet.as_str()).or_default();
            entry.0 += 1;
            entry.1.insert(trade.market_id.as_str());
            entry.2 += trade.notional();
        }

        let mut candidates: Vec<WalletActivity> = by_wallet
            .into_iter()
            .filter(|(_, (count, _, _))| *count >= self.config.min_trades)
            .map(|(wallet, (trade_count, markets, volume))| WalletActivity {
                wallet: wallet.to_string(),
                trade_count,
                unique_markets: markets.len(),
                volume,
                activity_score: 0.0,
            })
            .collect();

        let counts: Vec<f64> = candidates.iter().map(|c| c.trade_count as f64).collect();
        let uniques: Vec<f64> = candidates.iter().map(|c| c.unique_markets as f64).collect();

        for ((candidate, z_count), z_unique) in candidates.iter_mut().zip(z_scores(&counts)).zip(z_scores(&uniques)) {
            candidate.activity_score =
                self.config.trade_count_weight * z_count + self.config.unique_markets_weight * z_unique;
        }

        candidates.sort_by(|a, b| {
            b.activity_score
                .total_cmp(&a.activity_score)
                .then_with(|| b.trade_count.cmp(&a.trade_count))
                .then_with(|| a.wallet.cmp(&b.wallet))
        });
        candidates
    }
}

/// Standard scores using the sample deviation; all zero when it is zero or undefined.
fn z_scores(values: &[f64]) -> Vec<f64> {
    let mean = values.mean();
    let std_dev = values.std_dev();

    if std_dev > 0.0 && std_dev.is_finite() {
        values.iter().map(|v| (v - mean) / std_dev).collect()
    } else {
        vec![0.0; values.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::event;
    use crate::models::TradeSide;
    use rust_decimal_macros::dec;

    fn trades(wallet: &str, markets: &[&str], count: usize) -> Vec<TradeEvent> {
        (0..count)
            .map(|i| TradeEvent {
                wallet: wallet.to_string(),
                ..event(
                    &format!("{}-{}", wallet, i),
                    markets[i % markets.len()],
                    TradeSide::Buy,
                    dec!(10),
                    dec!(0.5),
                    i as i64,
                )
            })
            .collect()
    }

    #[test]
    fn test_scores_rank_by_weighted_activity() {
        let mut all = trades("0xa", &["m1", "m2"], 10);
        all.extend(trades("0xb", &["m1", "m2", "m3", "m4", "m5", "m6"], 6));
        all.extend(trades("0xc", &["m1"], 5));
        all.extend(trades("0xd", &["m1", "m2", "m3"], 3));

        let ranked = WalletScorer::new(DiscoveryConfig::default()).score(&all);

        let wallets: Vec<_> = ranked.iter().map(|r| r.wallet.as_str()).collect();
        assert_eq!(wallets, vec!["0xa", "0xb", "0xc"]);
        assert_eq!(ranked[1].unique_markets, 6);
        assert_eq!(ranked[0].volume, dec!(50));

        // Counts [10, 6, 5] and markets [2, 6, 1] share a sample deviation of sqrt(7)
        let sd = 7f64.sqrt();
        let expected = 0.8 * (3.0 / sd) + 0.2 * (-1.0 / sd);
        assert!((ranked[0].activity_score - expected).abs() < 1e-9);

        let total: f64 = ranked.iter().map(|r| r.activity_score).sum();
        assert!(total.abs() < 1e-9);
    }

    #[test]
    fn test_identical_activity_scores_zero() {
        let mut all = trades("0xa", &["m1"], 5);
        all.extend(trades("0xb", &["m2"], 5));

        let ranked = WalletScorer::new(DiscoveryConfig::default()).score(&all);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|r| r.activity_score == 0.0));
        // Ties fall back to address order
        assert_eq!(ranked[0].wallet, "0xa");
    }

    #[test]
    fn test_single_candidate_scores_zero() {
        let config = DiscoveryConfig {
            min_trades: 1,
            ..Default::default()
        };
        let ranked = WalletScorer::new(config).score(&trades("0xa", &["m1"], 2));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].activity_score, 0.0);
        assert!(WalletScorer::new(DiscoveryConfig::default()).score(&[]).is_empty());
    }
}
