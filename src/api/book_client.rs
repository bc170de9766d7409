//! CLOB order book reader: top-of-book quotes, no authentication.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::TradeSide;

use super::types::{BookLevel, OrderBook};
use super::{QuoteSource, SourceError};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only client for the CLOB order book.
pub struct BookClient {
    client: Client,
    base_url: String,
}

impl BookClient {
    pub fn new() -> Result<Self> {
        Self::with_base_url(CLOB_API_BASE.to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Get the order book for a token. `None` when the token has no book.
    pub async fn get_order_book(&self, token_id: &str) -> Result<Option<OrderBook>, SourceError> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);

        debug!(url = %url, "Fetching order book");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::SourceUnavailable(format!(
                "order book request failed: {} - {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| SourceError::SourceUnavailable(format!("unparseable order book: {}", e)))
    }
}

#[async_trait]
impl QuoteSource for BookClient {
    async fn best_price(&self, market_id: &str, side: TradeSide) -> Result<Option<Decimal>, SourceError> {
        Ok(self
            .get_order_book(market_id)
            .await?
            .and_then(|book| top_of_book(&book, side)))
    }
}

/// Price a `side` order executes at first: lowest ask for BUY, highest bid for SELL.
///
/// Level order in the response is not relied on; empty levels are ignored.
fn top_of_book(book: &OrderBook, side: TradeSide) -> Option<Decimal> {
    match side {
        TradeSide::Buy => executable(&book.asks).min(),
        TradeSide::Sell => executable(&book.bids).max(),
    }
}

fn executable(levels: &[BookLevel]) -> impl Iterator<Item = Decimal> + '_ {
    levels.iter().filter_map(|l| {
        let price = Decimal::from_str(&l.price).ok()?;
        let size = Decimal::from_str(&l.size).ok()?;
        (price > Decimal::ZERO && size > Decimal::ZERO).then_some(price)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: &str, size: &str) -> BookLevel {
        BookLevel {
            price: price.to_string(),
            size: size.to_string(),
        }
    }

    #[test]
    fn test_top_of_book_picks_executable_side() {
        let book = OrderBook {
            bids: vec![level("0.40", "100"), level("0.47", "20"), level("0.45", "5")],
            asks: vec![level("0.55", "10"), level("0.49", "0"), level("0.52", "30")],
        };

        assert_eq!(top_of_book(&book, TradeSide::Sell), Some(dec!(0.47)));
        // The empty 0.49 level is not executable
        assert_eq!(top_of_book(&book, TradeSide::Buy), Some(dec!(0.52)));
    }

    #[test]
    fn test_empty_book_has_no_quote() {
        let book: OrderBook = serde_json::from_str(r#"{"bids": [], "asks": [{"price": "x", "size": "1"}]}"#).unwrap();
        assert_eq!(top_of_book(&book, TradeSide::Buy), None);
        assert_eq!(top_of_book(&book, TradeSide::Sell), None);
    }
}
