//! Replication decisions.
//!
//! `decide` is a pure function of its inputs, so the live runner and the
//! backtest simulator share it unchanged.

use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{Decision, Position, ReplicationOrder, SkipReason, TradeEvent, TradeSide};

use super::position_sizer::PositionSizer;
use super::PolicyConfig;

/// Account state a decision is taken against.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// Spendable balance of the self account
    pub self_balance: Decimal,

    /// Latest balance estimate for the target wallet
    pub target_balance_estimate: Option<Decimal>,

    /// Self account position in the event's market
    pub self_position: Option<&'a Position>,

    /// Best available price right now, when the sink can quote one
    pub quote: Option<Decimal>,
}

/// Translates observed trades into sized replication orders.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    sizer: PositionSizer,
}

impl DecisionEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            sizer: PositionSizer::new(config),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        self.sizer.config()
    }

    /// Decide whether and how to replicate `event`.
    pub fn decide(&self, event: &TradeEvent, input: DecisionInput<'_>) -> Decision {
        let config = self.sizer.config();

        // A sell with nothing held is never replicated
        if event.side == TradeSide::Sell && input.self_position.map_or(true, |p| p.sellable().is_zero()) {
            return Decision::Skip(SkipReason::InsufficientPosition);
        }

        let Some((scale, source)) = self
            .sizer
            .scale_factor(input.self_balance, input.target_balance_estimate)
        else {
            return Decision::Skip(SkipReason::TargetBalanceUnavailable);
        };

        let projected = input.quote.unwrap_or(event.price);
        if slippage(event.side, event.price, projected) > config.max_slippage_pct {
            debug!(
                trade_id = %event.id,
                observed = %event.price,
                projected = %projected,
                "Projected slippage exceeds tolerance"
            );
            return Decision::Skip(SkipReason::SlippageExceeded);
        }

        let mut size = self.sizer.proposed_size(event.size, scale);
        if event.side == TradeSide::Sell {
            match self.sizer.cap_sell(size, input.self_position) {
                Some(capped) => size = capped,
                None => return Decision::Skip(SkipReason::InsufficientPosition),
            }
        }

        let price_limit = price_limit(event.side, event.price, config.max_slippage_pct);

        if event.side == TradeSide::Buy && size * price_limit > input.self_balance {
            return Decision::Skip(SkipReason::InsufficientBalance);
        }

        debug!(
            trade_id = %event.id,
            scale = %scale,
            scale_source = ?source,
            size = %size,
            price_limit = %price_limit,
            "Replication sized"
        );

        Decision::Replicate(ReplicationOrder::new(
            &event.id,
            &event.market_id,
            event.side,
            size,
            Some(price_limit),
        ))
    }
}

/// Adverse relative deviation of `projected` from `observed`.
pub fn slippage(side: TradeSide, observed: Decimal, projected: Decimal) -> Decimal {
    if observed <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let adverse = match side {
        TradeSide::Buy => projected - observed,
        TradeSide::Sell => observed - projected,
    };
    (adverse / observed).max(Decimal::ZERO)
}

/// Worst acceptable price for `side` given the observed price.
pub fn price_limit(side: TradeSide, observed: Decimal, tolerance: Decimal) -> Decimal {
    match side {
        TradeSide::Buy => observed * (Decimal::ONE + tolerance),
        TradeSide::Sell => observed * (Decimal::ONE - tolerance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::event;
    use rust_decimal_macros::dec;

    fn engine(scale: Decimal) -> DecisionEngine {
        DecisionEngine::new(PolicyConfig {
            scale_factor_override: Some(scale),
            ..Default::default()
        })
    }

    fn input(balance: Decimal, position: Option<&Position>) -> DecisionInput<'_> {
        DecisionInput {
            self_balance: balance,
            target_balance_estimate: None,
            self_position: position,
            quote: None,
        }
    }

    #[test]
    fn test_half_scale_buy() {
        let buy = event("t1", "m", TradeSide::Buy, dec!(100), dec!(0.50), 0);
        let decision = engine(dec!(0.5)).decide(&buy, input(dec!(1000), None));

        let order = decision.order().unwrap();
        assert_eq!(order.size, dec!(50));
        assert_eq!(order.side, TradeSide::Buy);
        assert_eq!(order.source_trade_id, "t1");
        assert_eq!(order.price_limit, Some(dec!(0.51)));
    }

    #[test]
    fn test_sell_without_position_skips() {
        let sell = event("t1", "m", TradeSide::Sell, dec!(10), dec!(0.50), 0);
        let flat = Position::new("m");

        for position in [None, Some(&flat)] {
            let decision = engine(dec!(1)).decide(&sell, input(dec!(1000), position));
            assert_eq!(decision, Decision::Skip(SkipReason::InsufficientPosition));
        }
    }

    #[test]
    fn test_sell_capped_at_holdings() {
        let mut held = Position::new("m");
        held.apply_fill(TradeSide::Buy, dec!(30), dec!(0.40));

        let sell = event("t1", "m", TradeSide::Sell, dec!(100), dec!(0.50), 0);
        let decision = engine(dec!(1)).decide(&sell, input(dec!(0), Some(&held)));

        let order = decision.order().unwrap();
        assert_eq!(order.size, dec!(30));
        assert_eq!(order.price_limit, Some(dec!(0.49)));
    }

    #[test]
    fn test_slippage_tolerance() {
        let buy = event("t1", "m", TradeSide::Buy, dec!(10), dec!(1.00), 0);
        let engine = engine(dec!(1));

        let quoted = |quote| DecisionInput {
            quote: Some(quote),
            ..input(dec!(1000), None)
        };

        assert_eq!(
            engine.decide(&buy, quoted(dec!(1.03))),
            Decision::Skip(SkipReason::SlippageExceeded)
        );
        let order = engine.decide(&buy, quoted(dec!(1.02)));
        assert_eq!(order.order().unwrap().price_limit, Some(dec!(1.02)));

        // Favorable moves never count as slippage
        assert!(engine.decide(&buy, quoted(dec!(0.90))).order().is_some());
    }

    #[test]
    fn test_target_balance_ratio() {
        let engine = DecisionEngine::new(PolicyConfig::default());
        let buy = event("t1", "m", TradeSide::Buy, dec!(100), dec!(0.50), 0);

        assert_eq!(
            engine.decide(&buy, input(dec!(1000), None)),
            Decision::Skip(SkipReason::TargetBalanceUnavailable)
        );

        let decision = engine.decide(
            &buy,
            DecisionInput {
                target_balance_estimate: Some(dec!(4000)),
                ..input(dec!(1000), None)
            },
        );
        assert_eq!(decision.order().unwrap().size, dec!(25));
    }

    #[test]
    fn test_buy_beyond_balance_skips() {
        let buy = event("t1", "m", TradeSide::Buy, dec!(100), dec!(0.50), 0);
        assert_eq!(
            engine(dec!(1)).decide(&buy, input(dec!(20), None)),
            Decision::Skip(SkipReason::InsufficientBalance)
        );
    }

    #[test]
    fn test_decide_is_pure() {
        let buy = event("t1", "m", TradeSide::Buy, dec!(77), dec!(0.33), 0);
        let engine = engine(dec!(0.3));
        assert_eq!(
            engine.decide(&buy, input(dec!(500), None)),
            engine.decide(&buy, input(dec!(500), None))
        );
    }
}
