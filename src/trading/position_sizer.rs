//! Proportional position sizing: balance ratio scale factor plus min/max clamps.

use rust_decimal::Decimal;

use crate::models::Position;

use super::PolicyConfig;

/// Where the scale factor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleSource {
    /// Fixed configured ratio
    Override,
    /// self_balance / target_balance_estimate
    BalanceRatio,
}

/// Calculator for replication order sizes.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: PolicyConfig,
}

impl PositionSizer {
    /// Create a new position sizer with given config.
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Resolve the self/target scale factor.
    ///
    /// The configured override always wins. Otherwise the ratio of the two
    /// balances is used, which needs a positive target estimate.
    pub fn scale_factor(
        &self,
        self_balance: Decimal,
        target_balance_estimate: Option<Decimal>,
    ) -> Option<(Decimal, ScaleSource)> {
        if let Some(scale) = self.config.scale_factor_override {
            return Some((scale, ScaleSource::Override));
        }

        match target_balance_estimate {
            Some(target) if target > Decimal::ZERO && self_balance >= Decimal::ZERO => {
                Some((self_balance / target, ScaleSource::BalanceRatio))
            }
            _ => None,
        }
    }

    /// Scale a source trade size and clamp it into the configured bounds.
    ///
    /// Sizes below the minimum are raised to it rather than dropped.
    pub fn proposed_size(&self, source_size: Decimal, scale: Decimal) -> Decimal {
        (source_size * scale)
            .max(self.config.min_order_size)
            .min(self.config.max_order_size)
            .normalize()
    }

    /// Cap a sell at the held size. `None` when there is nothing to sell.
    pub fn cap_sell(&self, proposed: Decimal, position: Option<&Position>) -> Option<Decimal> {
        let held = position.map(Position::sellable).unwrap_or(Decimal::ZERO);
        if held <= Decimal::ZERO {
            return None;
        }
        Some(proposed.min(held))
    }
}
