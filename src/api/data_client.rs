//! Data API client: read-only trade history, holdings and portfolio values.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{normalize_address, Position, TradeEvent, TradeSide};

use super::types::{PositionResponse, TradeResponse, ValueResponse};
use super::{BalanceError, BalanceSource, FetchCursor, SourceError, TradeSource};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE: u32 = 500;
const MAX_CATCHUP_PAGES: u32 = 20;
const PAGE_DELAY: Duration = Duration::from_millis(100);

/// Client for the Data API.
pub struct DataClient {
    client: Client,
    base_url: String,
    page_size: u32,
}

impl DataClient {
    /// Create a new data client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DATA_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            page_size: 100,
        })
    }

    /// Fetch one page of trades, newest first.
    pub async fn get_trades(&self, address: &str, limit: u32, offset: u32) -> Result<Vec<TradeEvent>, SourceError> {
        let url = format!(
            "{}/trades?user={}&takerOnly=false&limit={}&offset={}",
            self.base_url,
            address,
            limit.min(MAX_PAGE),
            offset
        );
        self.fetch_trades(&url, address).await
    }

    /// Fetch one page of market-wide trades, newest first.
    pub async fn get_recent_trades(&self, limit: u32, offset: u32) -> Result<Vec<TradeEvent>, SourceError> {
        let url = format!(
            "{}/trades?takerOnly=true&limit={}&offset={}",
            self.base_url,
            limit.min(MAX_PAGE),
            offset
        );
        self.fetch_trades(&url, "market-wide").await
    }

    /// Market-wide trades at or after `since`, paging back until it is reached.
    pub async fn get_recent_since(&self, since: DateTime<Utc>, max_pages: u32) -> Result<Vec<TradeEvent>, SourceError> {
        collect_since(MAX_PAGE, Some(since), max_pages, PAGE_DELAY, |offset| {
            self.get_recent_trades(MAX_PAGE, offset)
        })
        .await
    }

    async fn fetch_trades(&self, url: &str, address: &str) -> Result<Vec<TradeEvent>, SourceError> {
        debug!(url = %url, "Fetching trades");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, address, &body));
        }

        let items: Vec<TradeResponse> = response
            .json()
            .await
            .map_err(|e| SourceError::SourceUnavailable(format!("unparseable trades response: {}", e)))?;

        Ok(items.into_iter().filter_map(into_event).collect())
    }

    /// Fetch up to `lookback` most recent trades, paging as needed, oldest first.
    pub async fn get_history(&self, address: &str, lookback: u32) -> Result<Vec<TradeEvent>, SourceError> {
        let mut history = Vec::new();
        let mut offset = 0u32;

        while (history.len() as u32) < lookback {
            let want = (lookback - history.len() as u32).min(MAX_PAGE);
            let page = self.get_trades(address, want, offset).await?;
            let fetched = page.len() as u32;
            history.extend(page);

            if fetched < want {
                break;
            }
            offset += fetched;

            // Rate limiting
            tokio::time::sleep(PAGE_DELAY).await;
        }

        history.sort_by(|a, b| a.replay_order(b));
        Ok(history)
    }

    /// Fetch portfolio value for a wallet.
    pub async fn get_portfolio_value(&self, address: &str) -> Result<Decimal, BalanceError> {
        let url = format!("{}/value?user={}", self.base_url, address);

        debug!(url = %url, "Fetching portfolio value");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BalanceError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BalanceError::Unavailable(format!(
                "value request failed: {}",
                response.status()
            )));
        }

        let values: Vec<ValueResponse> = response
            .json()
            .await
            .map_err(|e| BalanceError::Unavailable(format!("unparseable value response: {}", e)))?;

        values
            .into_iter()
            .next()
            .map(|v| v.value)
            .ok_or_else(|| BalanceError::Unavailable(format!("no value reported for {}", address)))
    }

    /// Fetch open holdings for a wallet.
    pub async fn get_positions(&self, address: &str) -> Result<Vec<Position>, BalanceError> {
        let url = format!("{}/positions?user={}&sizeThreshold=0", self.base_url, address);

        debug!(url = %url, "Fetching positions");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BalanceError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BalanceError::Unavailable(format!(
                "positions request failed: {}",
                response.status()
            )));
        }

        let items: Vec<PositionResponse> = response
            .json()
            .await
            .map_err(|e| BalanceError::Unavailable(format!("unparseable positions response: {}", e)))?;

        Ok(items.into_iter().filter_map(into_position).collect())
    }
}

#[async_trait]
impl TradeSource for DataClient {
    async fn fetch_since(&self, wallet: &str, cursor: FetchCursor) -> Result<Vec<TradeEvent>, SourceError> {
        collect_since(self.page_size, cursor.since, MAX_CATCHUP_PAGES, PAGE_DELAY, |offset| {
            self.get_trades(wallet, self.page_size, offset)
        })
        .await
    }
}

#[async_trait]
impl BalanceSource for DataClient {
    async fn get(&self, wallet: &str) -> Result<Decimal, BalanceError> {
        self.get_portfolio_value(wallet).await
    }

    async fn positions(&self, wallet: &str) -> Result<Vec<Position>, BalanceError> {
        self.get_positions(wallet).await
    }
}

/// Walk newest-first pages by offset and keep trades at or after `since`.
///
/// Stops on the first page that reaches past `since`, on a short page, or
/// after `max_pages`. Without `since` only the first page is read.
async fn collect_since<F, Fut>(
    page_size: u32,
    since: Option<DateTime<Utc>>,
    max_pages: u32,
    page_delay: Duration,
    mut fetch_page: F,
) -> Result<Vec<TradeEvent>, SourceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<TradeEvent>, SourceError>>,
{
    let mut collected = Vec::new();
    let mut offset = 0u32;

    for page_no in 0..max_pages {
        if page_no > 0 {
            tokio::time::sleep(page_delay).await;
        }

        let page = fetch_page(offset).await?;
        let fetched = page.len() as u32;

        let Some(since) = since else {
            return Ok(page);
        };

        let reached = page.iter().any(|t| t.timestamp < since);
        collected.extend(page.into_iter().filter(|t| t.timestamp >= since));

        if reached || fetched < page_size {
            return Ok(collected);
        }
        offset += fetched;
    }

    warn!(pages = max_pages, kept = collected.len(), "Trade catch-up truncated at page limit");
    Ok(collected)
}

fn classify_status(status: StatusCode, address: &str, body: &str) -> SourceError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            SourceError::InvalidWallet(format!("{} ({}: {})", address, status, body))
        }
        _ => SourceError::SourceUnavailable(format!("trades request failed: {} - {}", status, body)),
    }
}

fn into_event(t: TradeResponse) -> Option<TradeEvent> {
    let Some(side) = TradeSide::parse(&t.side) else {
        warn!(side = %t.side, "Unknown trade side");
        return None;
    };

    let timestamp = Utc.timestamp_opt(t.timestamp, 0).single()?;

    if t.size <= Decimal::ZERO || t.price <= Decimal::ZERO {
        return None;
    }

    // Positions are per outcome token; fall back to condition + outcome
    let market_id = if t.asset.is_empty() {
        format!("{}:{}", t.condition_id, t.outcome)
    } else {
        t.asset
    };

    Some(TradeEvent {
        id: format!("{}_{}_{}", t.transaction_hash, market_id, side.as_str()),
        wallet: normalize_address(&t.proxy_wallet),
        market_id,
        side,
        size: t.size,
        price: t.price,
        timestamp,
        source_tx_ref: t.transaction_hash,
    })
}

fn into_position(p: PositionResponse) -> Option<Position> {
    if p.size <= Decimal::ZERO {
        return None;
    }

    let market_id = if p.asset.is_empty() {
        format!("{}:{}", p.condition_id, p.outcome)
    } else {
        p.asset
    };

    Some(Position::restore(market_id, p.size, p.avg_price, Decimal::ZERO, Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::event;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Newest-first trades served in pages, recording requested offsets.
    fn paged(trades: Vec<TradeEvent>, page_size: usize) -> (Vec<Vec<TradeEvent>>, Mutex<Vec<u32>>) {
        let mut newest_first = trades;
        newest_first.sort_by(|a, b| b.replay_order(a));
        let pages = newest_first.chunks(page_size).map(|c| c.to_vec()).collect();
        (pages, Mutex::new(Vec::new()))
    }

    async fn run_pager(
        pages: &[Vec<TradeEvent>],
        offsets: &Mutex<Vec<u32>>,
        page_size: u32,
        since: Option<DateTime<Utc>>,
        max_pages: u32,
    ) -> Vec<TradeEvent> {
        collect_since(page_size, since, max_pages, Duration::ZERO, |offset| {
            offsets.lock().unwrap().push(offset);
            let page = pages.get((offset / page_size) as usize).cloned().unwrap_or_default();
            async move { Ok(page) }
        })
        .await
        .unwrap()
    }

    fn burst(n: i64) -> Vec<TradeEvent> {
        (0..n)
            .map(|i| event(&format!("t{}", i), "m", TradeSide::Buy, dec!(1), dec!(0.5), i * 10))
            .collect()
    }

    fn response(side: &str, asset: &str) -> TradeResponse {
        TradeResponse {
            proxy_wallet: "0xABC".to_string(),
            side: side.to_string(),
            asset: asset.to_string(),
            condition_id: "0xcond".to_string(),
            size: dec!(25),
            price: dec!(0.42),
            timestamp: 1_700_000_000,
            outcome: "Yes".to_string(),
            transaction_hash: "0xhash".to_string(),
        }
    }

    #[test]
    fn test_into_event_maps_fields() {
        let event = into_event(response("buy", "123")).unwrap();
        assert_eq!(event.wallet, "0xabc");
        assert_eq!(event.market_id, "123");
        assert_eq!(event.side, TradeSide::Buy);
        assert_eq!(event.id, "0xhash_123_BUY");
        assert_eq!(event.source_tx_ref, "0xhash");
    }

    #[test]
    fn test_into_event_falls_back_to_condition() {
        let event = into_event(response("SELL", "")).unwrap();
        assert_eq!(event.market_id, "0xcond:Yes");
        assert!(into_event(response("MERGE", "1")).is_none());
    }

    #[tokio::test]
    async fn test_catch_up_pages_until_since_is_reached() {
        // 25 trades 10s apart, pages of 10; since lands inside the third page
        let trades = burst(25);
        let since = trades[3].timestamp;
        let (pages, offsets) = paged(trades, 10);

        let kept = run_pager(&pages, &offsets, 10, Some(since), 20).await;

        assert_eq!(kept.len(), 22);
        assert!(kept.iter().all(|t| t.timestamp >= since));
        assert_eq!(*offsets.lock().unwrap(), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_catch_up_stops_on_page_reaching_past_since() {
        let trades = burst(25);
        // Newest 10 are t15..t24; since = t16 so page 0 already reaches past it
        let since = trades[16].timestamp;
        let (pages, offsets) = paged(trades, 10);

        let kept = run_pager(&pages, &offsets, 10, Some(since), 20).await;

        assert_eq!(kept.len(), 9);
        assert_eq!(*offsets.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_catch_up_respects_page_limit() {
        let trades = burst(50);
        let since = trades[0].timestamp;
        let (pages, offsets) = paged(trades, 10);

        let kept = run_pager(&pages, &offsets, 10, Some(since), 2).await;

        assert_eq!(kept.len(), 20);
        assert_eq!(offsets.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_cursor_reads_first_page_only() {
        let (pages, offsets) = paged(burst(25), 10);

        let kept = run_pager(&pages, &offsets, 10, None, 20).await;

        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0].id, "t24");
        assert_eq!(*offsets.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_into_position_skips_closed_holdings() {
        let open: PositionResponse = serde_json::from_str(
            r#"{"asset": "123", "conditionId": "0xcond", "outcome": "Yes", "size": "12.5", "avgPrice": "0.44"}"#,
        )
        .unwrap();
        let position = into_position(open).unwrap();
        assert_eq!(position.market_id, "123");
        assert_eq!(position.net_size, dec!(12.5));
        assert_eq!(position.avg_entry_price, dec!(0.44));

        let closed: PositionResponse =
            serde_json::from_str(r#"{"conditionId": "0xcond", "size": "0"}"#).unwrap();
        assert!(into_position(closed).is_none());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "0x1", ""),
            SourceError::InvalidWallet(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "0x1", ""),
            SourceError::SourceUnavailable(_)
        ));
    }
}
