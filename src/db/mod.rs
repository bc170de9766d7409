//! Database persistence for replication state and wallet screening.
//!
//! Stores everything needed to resume after restart:
//! - Watched wallets
//! - Per-wallet cursors with their seen-id windows (no duplicate replication)
//! - Replication orders and their final status
//! - The self account's cash and positions as last booked
//! - Backtest results, one row per wallet, for ranking
//!
//! Decimal amounts are stored as TEXT to keep them exact.

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::backtest::BacktestResult;
use crate::models::{Position, ReplicationOrder, WalletRole};
use crate::trading::{CursorStore, Ledger, WalletCursor};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Watched wallet record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredWallet {
    pub address: String,
    pub role: String,
    pub is_active: bool,
    pub added_at: String,
}

/// Stored replication order record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub id: String,
    pub source_trade_id: String,
    pub wallet: String,
    pub market_id: String,
    pub side: String,
    pub size: String,
    pub price_limit: Option<String>,
    pub status: String,
    pub filled_size: String,
    pub avg_fill_price: Option<String>,
    pub attempts: i64,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
}

/// Stored self-account position.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredPosition {
    market_id: String,
    net_size: String,
    avg_entry_price: String,
    realized_pnl: String,
    round_trip_pnl: String,
}

impl From<StoredPosition> for Position {
    fn from(row: StoredPosition) -> Self {
        Position::restore(
            row.market_id,
            parse_decimal(&row.net_size),
            parse_decimal(&row.avg_entry_price),
            parse_decimal(&row.realized_pnl),
            parse_decimal(&row.round_trip_pnl),
        )
    }
}

/// Stored backtest result, keyed by wallet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredBacktestResult {
    pub wallet: String,
    pub total_trades_replicated: i64,
    pub skipped_trades: i64,
    pub realized_pnl: String,
    pub win_rate: f64,
    pub closed_round_trips: i64,
    pub max_drawdown: String,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub starting_balance: String,
    pub final_balance: String,
    pub run_at: String,
}

impl StoredBacktestResult {
    pub fn realized_pnl(&self) -> Decimal {
        parse_decimal(&self.realized_pnl)
    }

    pub fn max_drawdown(&self) -> Decimal {
        parse_decimal(&self.max_drawdown)
    }

    pub fn final_balance(&self) -> Decimal {
        parse_decimal(&self.final_balance)
    }
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or_default()
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is its own database
        let in_memory = database_url.contains(":memory:");
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Watched wallets
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watched_wallets (
                address TEXT PRIMARY KEY,
                role TEXT NOT NULL DEFAULT 'target',
                is_active INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Poll cursors and seen-id windows
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_cursors (
                wallet TEXT PRIMARY KEY,
                cursor_json TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Replication orders
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_orders (
                id TEXT PRIMARY KEY,
                source_trade_id TEXT NOT NULL,
                wallet TEXT NOT NULL,
                market_id TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                price_limit TEXT,
                status TEXT NOT NULL,
                filled_size TEXT NOT NULL DEFAULT '0',
                avg_fill_price TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                skip_reason TEXT,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Self-account holdings
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS self_positions (
                market_id TEXT PRIMARY KEY,
                net_size TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL DEFAULT '0',
                round_trip_pnl TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Scalar bot state (self cash)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Backtest results
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_results (
                wallet TEXT PRIMARY KEY,
                total_trades_replicated INTEGER NOT NULL,
                skipped_trades INTEGER NOT NULL DEFAULT 0,
                realized_pnl TEXT NOT NULL,
                win_rate REAL NOT NULL,
                closed_round_trips INTEGER NOT NULL DEFAULT 0,
                max_drawdown TEXT NOT NULL,
                max_drawdown_pct REAL NOT NULL DEFAULT 0,
                sharpe_ratio REAL NOT NULL DEFAULT 0,
                starting_balance TEXT NOT NULL,
                final_balance TEXT NOT NULL,
                run_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_status ON replication_orders(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_trade ON replication_orders(source_trade_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Wallets ====================

    /// Start (or resume) watching a wallet.
    pub async fn track_wallet(&self, address: &str, role: WalletRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watched_wallets (address, role)
            VALUES (?, ?)
            ON CONFLICT(address) DO UPDATE SET
                role = excluded.role,
                is_active = 1,
                updated_at = datetime('now')
            "#,
        )
        .bind(address)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stop watching a wallet. Returns false when it was not known.
    pub async fn untrack_wallet(&self, address: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE watched_wallets SET is_active = 0, updated_at = datetime('now') WHERE address = ?",
        )
        .bind(address)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Active target wallet addresses.
    pub async fn get_active_targets(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT address FROM watched_wallets WHERE is_active = 1 AND role = 'target' ORDER BY added_at, address",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(a,)| a).collect())
    }

    /// All wallets ever watched.
    pub async fn list_wallets(&self) -> Result<Vec<StoredWallet>> {
        sqlx::query_as::<_, StoredWallet>(
            "SELECT address, role, is_active, added_at FROM watched_wallets ORDER BY added_at, address",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch wallets")
    }

    // ==================== Cursors ====================

    /// Persist a wallet's cursor.
    pub async fn save_cursor(&self, wallet: &str, cursor: &WalletCursor) -> Result<()> {
        let json = serde_json::to_string(cursor).context("Failed to serialize cursor")?;

        sqlx::query(
            r#"
            INSERT INTO wallet_cursors (wallet, cursor_json)
            VALUES (?, ?)
            ON CONFLICT(wallet) DO UPDATE SET
                cursor_json = excluded.cursor_json,
                updated_at = datetime('now')
            "#,
        )
        .bind(wallet)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_cursor(&self, wallet: &str) -> Result<Option<WalletCursor>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT cursor_json FROM wallet_cursors WHERE wallet = ?")
            .bind(wallet)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(json,)| serde_json::from_str(&json).context("Corrupt cursor"))
            .transpose()
    }

    /// Load every persisted cursor into a store.
    pub async fn load_cursors(&self) -> Result<CursorStore> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT wallet, cursor_json FROM wallet_cursors")
            .fetch_all(&self.pool)
            .await?;

        let mut store = CursorStore::new();
        for (wallet, json) in rows {
            let cursor: WalletCursor =
                serde_json::from_str(&json).with_context(|| format!("Corrupt cursor for {}", wallet))?;
            store.insert(wallet, cursor);
        }

        Ok(store)
    }

    // ==================== Orders ====================

    /// Record a replication order in its current state. Returns the row id.
    pub async fn save_order(&self, wallet: &str, order: &ReplicationOrder) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO replication_orders (
                id, source_trade_id, wallet, market_id, side, size, price_limit,
                status, filled_size, avg_fill_price, attempts, skip_reason, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&order.source_trade_id)
        .bind(wallet)
        .bind(&order.market_id)
        .bind(order.side.as_str())
        .bind(order.size.to_string())
        .bind(order.price_limit.map(|p| p.to_string()))
        .bind(order.status.as_str())
        .bind(order.filled_size.to_string())
        .bind(order.avg_fill_price.map(|p| p.to_string()))
        .bind(order.attempts as i64)
        .bind(order.skip_reason.map(|r| r.as_str()))
        .bind(order.last_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Most recent orders, newest first.
    pub async fn get_recent_orders(&self, limit: i64) -> Result<Vec<StoredOrder>> {
        sqlx::query_as::<_, StoredOrder>(
            "SELECT * FROM replication_orders ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders")
    }

    /// Order counts per status.
    pub async fn get_order_stats(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as("SELECT status, COUNT(*) FROM replication_orders GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch order stats")
    }

    // ==================== Ledger ====================

    /// Persist one market's position as currently booked.
    pub async fn save_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO self_positions (market_id, net_size, avg_entry_price, realized_pnl, round_trip_pnl)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                net_size = excluded.net_size,
                avg_entry_price = excluded.avg_entry_price,
                realized_pnl = excluded.realized_pnl,
                round_trip_pnl = excluded.round_trip_pnl,
                updated_at = datetime('now')
            "#,
        )
        .bind(&position.market_id)
        .bind(position.net_size.to_string())
        .bind(position.avg_entry_price.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(position.round_trip_pnl().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_cash(&self, cash: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_state (key, value) VALUES ('cash', ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(cash.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persisted positions, flat ones excluded.
    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT market_id, net_size, avg_entry_price, realized_pnl, round_trip_pnl FROM self_positions ORDER BY market_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        Ok(rows
            .into_iter()
            .map(Position::from)
            .filter(|p| !p.is_flat())
            .collect())
    }

    /// Last persisted cash, if the bot ever booked a fill.
    pub async fn load_cash(&self) -> Result<Option<Decimal>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM bot_state WHERE key = 'cash'")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(value,)| Decimal::from_str(&value).context("Corrupt cash value"))
            .transpose()
    }

    /// Ledger as last persisted, or `None` before the first booked fill.
    pub async fn load_ledger(&self) -> Result<Option<Ledger>> {
        let Some(cash) = self.load_cash().await? else {
            return Ok(None);
        };
        Ok(Some(Ledger::from_parts(cash, self.load_positions().await?)))
    }

    // ==================== Backtests ====================

    /// Insert or replace the backtest result for its wallet.
    pub async fn save_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backtest_results (
                wallet, total_trades_replicated, skipped_trades, realized_pnl, win_rate,
                closed_round_trips, max_drawdown, max_drawdown_pct, sharpe_ratio,
                starting_balance, final_balance
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(wallet) DO UPDATE SET
                total_trades_replicated = excluded.total_trades_replicated,
                skipped_trades = excluded.skipped_trades,
                realized_pnl = excluded.realized_pnl,
                win_rate = excluded.win_rate,
                closed_round_trips = excluded.closed_round_trips,
                max_drawdown = excluded.max_drawdown,
                max_drawdown_pct = excluded.max_drawdown_pct,
                sharpe_ratio = excluded.sharpe_ratio,
                starting_balance = excluded.starting_balance,
                final_balance = excluded.final_balance,
                run_at = datetime('now')
            "#,
        )
        .bind(&result.wallet)
        .bind(result.total_trades_replicated as i64)
        .bind(result.skipped_trades as i64)
        .bind(result.realized_pnl.to_string())
        .bind(result.win_rate)
        .bind(result.closed_round_trips as i64)
        .bind(result.max_drawdown.to_string())
        .bind(result.max_drawdown_pct)
        .bind(result.sharpe_ratio)
        .bind(result.starting_balance.to_string())
        .bind(result.final_balance.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Backtest results ranked by P&L, best first.
    pub async fn rank_backtest_results(&self, limit: i64) -> Result<Vec<StoredBacktestResult>> {
        sqlx::query_as::<_, StoredBacktestResult>(
            r#"
            SELECT * FROM backtest_results
            ORDER BY CAST(realized_pnl AS REAL) DESC, win_rate DESC, wallet
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to rank backtest results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, SkipReason, TradeSide};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn result(wallet: &str, pnl: Decimal) -> BacktestResult {
        BacktestResult {
            wallet: wallet.to_string(),
            total_trades_replicated: 4,
            skipped_trades: 1,
            realized_pnl: pnl,
            win_rate: 0.5,
            closed_round_trips: 2,
            profit_factor: 1.5,
            max_drawdown: dec!(12.5),
            max_drawdown_pct: 0.00125,
            sharpe_ratio: 0.3,
            starting_balance: dec!(10000),
            final_balance: dec!(10000) + pnl,
            start_time: None,
            end_time: None,
        }
    }

    #[tokio::test]
    async fn test_track_and_untrack() {
        let db = memory_db().await;

        db.track_wallet("0xa", WalletRole::Target).await.unwrap();
        db.track_wallet("0xb", WalletRole::Target).await.unwrap();
        db.track_wallet("0xself", WalletRole::SelfAccount).await.unwrap();

        let mut targets = db.get_active_targets().await.unwrap();
        targets.sort();
        assert_eq!(targets, vec!["0xa", "0xb"]);

        assert!(db.untrack_wallet("0xa").await.unwrap());
        assert!(!db.untrack_wallet("0xmissing").await.unwrap());
        assert_eq!(db.get_active_targets().await.unwrap(), vec!["0xb"]);
        assert_eq!(db.list_wallets().await.unwrap().len(), 3);

        // Tracking again reactivates
        db.track_wallet("0xa", WalletRole::Target).await.unwrap();
        assert_eq!(db.get_active_targets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let db = memory_db().await;
        assert!(db.load_cursor("0xa").await.unwrap().is_none());

        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut cursor = WalletCursor::default();
        cursor.seen.insert("t1", ts, 16);
        cursor.last_timestamp = Some(ts);
        cursor.last_id = Some("t1".to_string());

        db.save_cursor("0xa", &cursor).await.unwrap();
        cursor.seen.insert("t2", ts, 16);
        db.save_cursor("0xa", &cursor).await.unwrap();

        let loaded = db.load_cursor("0xa").await.unwrap().unwrap();
        assert_eq!(loaded, cursor);
        assert!(loaded.seen.contains("t2"));

        let mut store = db.load_cursors().await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("0xa"), cursor);
    }

    #[tokio::test]
    async fn test_ledger_round_trip() {
        let db = memory_db().await;
        assert!(db.load_ledger().await.unwrap().is_none());

        let mut ledger = Ledger::new(dec!(100));
        ledger.apply_fill("m1", TradeSide::Buy, dec!(10), dec!(0.5));
        ledger.apply_fill("m2", TradeSide::Buy, dec!(4), dec!(0.25));
        ledger.apply_fill("m2", TradeSide::Sell, dec!(4), dec!(0.30));
        for position in ledger.positions() {
            assert_ok!(db.save_position(position).await);
        }
        assert_ok!(db.save_cash(ledger.cash()).await);

        let restored = assert_ok!(db.load_ledger().await).unwrap();
        assert_eq!(restored.cash(), dec!(95.2));
        assert_eq!(restored.position("m1").unwrap().net_size, dec!(10));
        assert_eq!(restored.position("m1").unwrap().avg_entry_price, dec!(0.5));
        // Flat positions are not restored
        assert!(restored.position("m2").is_none());
    }

    #[tokio::test]
    async fn test_save_orders() {
        let db = memory_db().await;

        let mut filled = ReplicationOrder::new("t1", "m", TradeSide::Buy, dec!(10), Some(dec!(0.51)));
        filled.record_fill(dec!(10), dec!(0.5));
        filled.status = OrderStatus::Filled;
        filled.attempts = 1;
        db.save_order("0xa", &filled).await.unwrap();

        let skipped = ReplicationOrder::skipped("t2", "m", TradeSide::Sell, SkipReason::InsufficientPosition);
        db.save_order("0xa", &skipped).await.unwrap();

        let orders = db.get_recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 2);
        let stored = orders.iter().find(|o| o.source_trade_id == "t1").unwrap();
        assert_eq!(stored.status, "FILLED");
        assert_eq!(Decimal::from_str(&stored.filled_size).unwrap(), dec!(10));
        assert_eq!(stored.price_limit.as_deref(), Some("0.51"));

        let stats = db.get_order_stats().await.unwrap();
        assert_eq!(stats, vec![("FILLED".to_string(), 1), ("SKIPPED".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_rank_backtest_results() {
        let db = memory_db().await;

        db.save_backtest_result(&result("0xa", dec!(5))).await.unwrap();
        db.save_backtest_result(&result("0xb", dec!(120.5))).await.unwrap();
        db.save_backtest_result(&result("0xc", dec!(-40))).await.unwrap();
        // Re-running replaces the previous row
        db.save_backtest_result(&result("0xa", dec!(300))).await.unwrap();

        let ranked = db.rank_backtest_results(10).await.unwrap();
        let wallets: Vec<_> = ranked.iter().map(|r| r.wallet.as_str()).collect();
        assert_eq!(wallets, vec!["0xa", "0xb", "0xc"]);
        assert_eq!(ranked[0].realized_pnl(), dec!(300));
        assert_eq!(ranked[2].final_balance(), dec!(9960));

        assert_eq!(db.rank_backtest_results(1).await.unwrap().len(), 1);
    }
}
