//! In-process order sink for dry-run replication.
//!
//! Orders fill completely at the last quoted price for the market and side
//! when one is known and within the limit, otherwise at the limit price
//! itself. Quotes come from an attached `QuoteSource`, consulted on every
//! `best_price` call; without one every order fills at its limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::TradeSide;

use super::{FillStatus, OrderRequest, OrderSink, QuoteSource, SinkError, SinkFill};

/// Simulated sink that never touches an exchange.
#[derive(Default)]
pub struct PaperSink {
    quotes: RwLock<HashMap<(String, TradeSide), Decimal>>,
    quote_source: Option<Arc<dyn QuoteSource>>,
    min_order_size: Decimal,
}

impl PaperSink {
    pub fn new(min_order_size: Decimal) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            quote_source: None,
            min_order_size,
        }
    }

    /// Price paper orders against a live book.
    pub fn with_quotes(mut self, source: Arc<dyn QuoteSource>) -> Self {
        self.quote_source = Some(source);
        self
    }
}

#[async_trait]
impl OrderSink for PaperSink {
    async fn submit(&self, order: &OrderRequest) -> Result<SinkFill, SinkError> {
        if order.size <= Decimal::ZERO || order.size < self.min_order_size {
            return Err(SinkError::Rejected(format!(
                "size {} below minimum {}",
                order.size, self.min_order_size
            )));
        }

        let quote = self
            .quotes
            .read()
            .await
            .get(&(order.market_id.clone(), order.side))
            .copied();

        let price = match (quote, order.price_limit) {
            (Some(q), Some(limit)) => {
                let within = match order.side {
                    TradeSide::Buy => q <= limit,
                    TradeSide::Sell => q >= limit,
                };
                if !within {
                    return Ok(SinkFill {
                        filled_size: Decimal::ZERO,
                        avg_fill_price: Decimal::ZERO,
                        status: FillStatus::Unfilled,
                    });
                }
                q
            }
            (Some(q), None) => q,
            (None, Some(limit)) => limit,
            (None, None) => return Err(SinkError::Rejected("no price available".to_string())),
        };

        info!(
            market = %order.market_id,
            side = %order.side,
            size = %order.size,
            price = %price,
            "[DRY RUN] Paper fill"
        );

        Ok(SinkFill {
            filled_size: order.size,
            avg_fill_price: price,
            status: FillStatus::Filled,
        })
    }

    async fn best_price(&self, market_id: &str, side: TradeSide) -> Result<Option<Decimal>, SinkError> {
        let key = (market_id.to_string(), side);

        if let Some(source) = &self.quote_source {
            let live = source
                .best_price(market_id, side)
                .await
                .map_err(|e| SinkError::Transient(e.to_string()))?;

            let mut quotes = self.quotes.write().await;
            match live {
                Some(price) => {
                    debug!(market = %market_id, side = %side, price = %price, "Quote refreshed");
                    quotes.insert(key, price);
                }
                None => {
                    quotes.remove(&key);
                }
            }
            return Ok(live);
        }

        Ok(self.quotes.read().await.get(&key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SourceError;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    /// One-sided book: quotes `side` only.
    struct FixedBook {
        side: TradeSide,
        price: Option<Decimal>,
    }

    fn book(side: TradeSide, price: Option<Decimal>) -> Arc<FixedBook> {
        Arc::new(FixedBook { side, price })
    }

    #[async_trait]
    impl QuoteSource for FixedBook {
        async fn best_price(&self, _market_id: &str, side: TradeSide) -> Result<Option<Decimal>, SourceError> {
            Ok(if side == self.side { self.price } else { None })
        }
    }

    struct DownBook;

    #[async_trait]
    impl QuoteSource for DownBook {
        async fn best_price(&self, _market_id: &str, _side: TradeSide) -> Result<Option<Decimal>, SourceError> {
            Err(SourceError::SourceUnavailable("book offline".to_string()))
        }
    }

    fn request(side: TradeSide, size: Decimal, limit: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            market_id: "m".to_string(),
            side,
            size,
            price_limit: limit,
        }
    }

    #[tokio::test]
    async fn test_fills_at_limit_without_quote() {
        let sink = PaperSink::new(dec!(1));
        let fill = sink.submit(&request(TradeSide::Buy, dec!(10), Some(dec!(0.51)))).await.unwrap();
        assert_eq!(fill.status, FillStatus::Filled);
        assert_eq!(fill.avg_fill_price, dec!(0.51));
    }

    #[tokio::test]
    async fn test_quote_outside_limit_does_not_fill() {
        let sink = PaperSink::new(dec!(1)).with_quotes(book(TradeSide::Buy, Some(dec!(0.60))));
        assert_eq!(sink.best_price("m", TradeSide::Buy).await.unwrap(), Some(dec!(0.60)));
        // Quotes are per side
        assert_eq!(sink.best_price("m", TradeSide::Sell).await.unwrap(), None);

        let fill = sink.submit(&request(TradeSide::Buy, dec!(10), Some(dec!(0.51)))).await.unwrap();
        assert_eq!(fill.status, FillStatus::Unfilled);
        let sell = sink.submit(&request(TradeSide::Sell, dec!(10), Some(dec!(0.45)))).await.unwrap();
        assert_eq!(sell.avg_fill_price, dec!(0.45));
    }

    #[tokio::test]
    async fn test_rejects_small_orders() {
        let sink = PaperSink::new(dec!(5));
        let err = assert_err!(sink.submit(&request(TradeSide::Sell, dec!(2), Some(dec!(0.4)))).await);
        assert!(matches!(err, SinkError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_live_book_prices_the_fill() {
        let sink = PaperSink::new(dec!(1)).with_quotes(book(TradeSide::Buy, Some(dec!(0.48))));

        assert_eq!(assert_ok!(sink.best_price("m", TradeSide::Buy).await), Some(dec!(0.48)));
        let fill = assert_ok!(sink.submit(&request(TradeSide::Buy, dec!(10), Some(dec!(0.51)))).await);
        assert_eq!(fill.status, FillStatus::Filled);
        assert_eq!(fill.avg_fill_price, dec!(0.48));
    }

    #[tokio::test]
    async fn test_missing_book_falls_back_to_limit() {
        let sink = PaperSink::new(dec!(1)).with_quotes(book(TradeSide::Sell, None));

        assert_eq!(sink.best_price("m", TradeSide::Sell).await.unwrap(), None);
        let fill = sink.submit(&request(TradeSide::Sell, dec!(4), Some(dec!(0.45)))).await.unwrap();
        assert_eq!(fill.avg_fill_price, dec!(0.45));
    }

    #[tokio::test]
    async fn test_book_outage_is_transient() {
        let sink = PaperSink::new(dec!(1)).with_quotes(Arc::new(DownBook));
        let err = assert_err!(sink.best_price("m", TradeSide::Buy).await);
        assert!(matches!(err, SinkError::Transient(_)));
    }
}
