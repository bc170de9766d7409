//! Position held by the self account (live) or the simulated ledger (backtest).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::TradeSide;

/// Net holding in a single market.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Market (outcome token) identifier
    pub market_id: String,

    /// Signed size: positive is long, negative is short
    pub net_size: Decimal,

    /// Average entry price of the open size
    pub avg_entry_price: Decimal,

    /// Realized P&L accumulated over the life of this position
    pub realized_pnl: Decimal,

    /// Realized P&L of the round trip currently open
    #[serde(default)]
    round_trip_pnl: Decimal,
}

/// Effect of applying one fill to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillEffect {
    /// P&L realized by this fill
    pub realized_pnl: Decimal,

    /// Set when the fill took the position back to flat (or through it)
    pub closed_round_trip: Option<Decimal>,
}

impl Position {
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            ..Default::default()
        }
    }

    /// Rebuild a position from stored or externally reported state.
    pub fn restore(
        market_id: impl Into<String>,
        net_size: Decimal,
        avg_entry_price: Decimal,
        realized_pnl: Decimal,
        round_trip_pnl: Decimal,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            net_size,
            avg_entry_price,
            realized_pnl,
            round_trip_pnl,
        }
    }

    /// Realized P&L of the round trip still open.
    pub fn round_trip_pnl(&self) -> Decimal {
        self.round_trip_pnl
    }

    pub fn is_flat(&self) -> bool {
        self.net_size.is_zero()
    }

    /// Size that can be sold without going short.
    pub fn sellable(&self) -> Decimal {
        self.net_size.max(Decimal::ZERO)
    }

    /// Apply a fill of `size` tokens at `price`.
    pub fn apply_fill(&mut self, side: TradeSide, size: Decimal, price: Decimal) -> FillEffect {
        if size <= Decimal::ZERO {
            return FillEffect::default();
        }

        let signed = side.sign() * size;
        let open = self.net_size.abs();

        // Opening or adding in the same direction
        if self.net_size.is_zero() || self.net_size.is_sign_positive() == signed.is_sign_positive() {
            self.avg_entry_price = (self.avg_entry_price * open + price * size) / (open + size);
            self.net_size += signed;
            return FillEffect::default();
        }

        let closing = size.min(open);
        let direction = if self.net_size.is_sign_positive() {
            Decimal::ONE
        } else {
            Decimal::NEGATIVE_ONE
        };
        let realized = closing * (price - self.avg_entry_price) * direction;

        self.realized_pnl += realized;
        self.round_trip_pnl += realized;
        self.net_size += signed;

        if closing < open {
            return FillEffect {
                realized_pnl: realized,
                closed_round_trip: None,
            };
        }

        let trip = self.round_trip_pnl;
        self.round_trip_pnl = Decimal::ZERO;
        self.avg_entry_price = if self.net_size.is_zero() {
            Decimal::ZERO
        } else {
            // Flipped through flat: the residual opens a new round trip
            price
        };

        FillEffect {
            realized_pnl: realized,
            closed_round_trip: Some(trip),
        }
    }

    /// Unrealized P&L of the open size at `price`.
    pub fn unrealized_at(&self, price: Decimal) -> Decimal {
        self.net_size * (price - self.avg_entry_price)
    }

    /// Market value of the open size at `price`.
    pub fn value_at(&self, price: Decimal) -> Decimal {
        self.net_size * price
    }
}
