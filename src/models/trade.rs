//! Trade events observed on watched wallets.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Parse a side string from an API payload.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }

    /// Signed multiplier applied to sizes (+1 for BUY, -1 for SELL).
    pub fn sign(&self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a wallet is copied from or traded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletRole {
    /// Watched wallet whose trades are replicated or backtested
    Target,
    /// The controlled account that executes replicated orders
    SelfAccount,
}

impl WalletRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletRole::Target => "target",
            WalletRole::SelfAccount => "self",
        }
    }
}

/// Wallet identity. The role is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wallet {
    address: String,
    role: WalletRole,
}

impl Wallet {
    pub fn target(address: impl Into<String>) -> Self {
        Self {
            address: normalize_address(&address.into()),
            role: WalletRole::Target,
        }
    }

    pub fn self_account(address: impl Into<String>) -> Self {
        Self {
            address: normalize_address(&address.into()),
            role: WalletRole::SelfAccount,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn role(&self) -> WalletRole {
        self.role
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Addresses are compared case-insensitively.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// A single trade observed on a watched wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Source-assigned identifier, unique per wallet
    pub id: String,

    /// Wallet address that executed the trade
    pub wallet: String,

    /// Market (outcome token) identifier
    pub market_id: String,

    /// Trade direction
    pub side: TradeSide,

    /// Number of outcome tokens traded
    pub size: Decimal,

    /// Price per token
    pub price: Decimal,

    /// When the trade occurred
    pub timestamp: DateTime<Utc>,

    /// On-chain transaction reference
    #[serde(default)]
    pub source_tx_ref: String,
}

impl TradeEvent {
    /// Notional value of the trade.
    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }

    /// Replay order: timestamp first, id breaks ties.
    pub fn replay_order(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::event;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_parsing() {
        assert_eq!(TradeSide::parse("buy"), Some(TradeSide::Buy));
        assert_eq!(TradeSide::parse("SELL"), Some(TradeSide::Sell));
        assert_eq!(TradeSide::parse("hold"), None);
        assert_eq!(TradeSide::Sell.sign(), dec!(-1));
    }

    #[test]
    fn test_wallet_role_is_fixed() {
        let w = Wallet::target("0xABCdef");
        assert_eq!(w.address(), "0xabcdef");
        assert_eq!(w.role(), WalletRole::Target);
        assert_eq!(Wallet::self_account("0x1").role().as_str(), "self");
    }

    #[test]
    fn test_replay_order_breaks_ties_by_id() {
        let a = event("a", "m", TradeSide::Buy, dec!(1), dec!(0.5), 10);
        let b = event("b", "m", TradeSide::Buy, dec!(1), dec!(0.5), 10);
        let c = event("0", "m", TradeSide::Buy, dec!(1), dec!(0.5), 11);
        assert_eq!(a.replay_order(&b), Ordering::Less);
        assert_eq!(c.replay_order(&b), Ordering::Greater);
        assert_eq!(a.notional(), dec!(0.5));
    }
}
