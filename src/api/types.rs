//! API response types for the Data API and the CLOB order book.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Trade response from /trades endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    pub proxy_wallet: String,
    pub side: String,
    #[serde(default)]
    pub asset: String,
    pub condition_id: String,
    pub size: Decimal,
    pub price: Decimal,
    pub timestamp: i64,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub transaction_hash: String,
}

/// Portfolio value entry from /value endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueResponse {
    #[serde(default)]
    pub user: String,
    pub value: Decimal,
}

/// Holding from /positions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    #[serde(default)]
    pub asset: String,
    pub condition_id: String,
    #[serde(default)]
    pub outcome: String,
    pub size: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
}

/// Order book level. Prices and sizes arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    pub price: String,
    pub size: String,
}

/// Order book response from /book endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}
