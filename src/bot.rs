//! Bot runner: live replication of watched wallets onto the self account.
//!
//! Handles:
//! - One polling task per watched wallet, each with its own cursor
//! - A single consumer that decides and executes trades one at a time
//! - Persisting orders, the self ledger and cursors so restarts neither
//!   replicate twice nor forget holdings
//! - Graceful shutdown between iterations

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{BalanceSource, OrderSink, SourceError, TradeSource};
use crate::db::Database;
use crate::models::{Decision, OrderStatus, ReplicationOrder, TradeEvent};
use crate::trading::{
    ActivityMonitor, ConfigError, DecisionEngine, DecisionInput, ExecutionPipeline, Ledger, MonitorConfig,
    PolicyConfig, RetryConfig, TargetBalanceEstimator, WalletCursor, WalletHealth,
};

/// Bot configuration.
#[derive(Debug, Clone, Default)]
pub struct BotConfig {
    /// Self account address, used to read the starting balance and holdings
    pub self_address: Option<String>,

    /// Starting cash when neither the self balance nor a persisted ledger exists
    pub starting_balance: Decimal,

    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
}

impl BotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::trading::non_negative("starting_balance", self.starting_balance)?;
        self.policy.validate()?;
        self.retry.validate()?;
        self.monitor.validate()
    }
}

/// One poll result handed from a wallet task to the consumer.
#[derive(Debug, Clone)]
pub struct MonitorUpdate {
    pub wallet: String,
    pub events: Vec<TradeEvent>,
    pub cursor: WalletCursor,
    pub health: WalletHealth,
    /// The source does not know this wallet; its task has stopped
    pub invalid: bool,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Database,
    source: Arc<dyn TradeSource>,
    balances: Arc<dyn BalanceSource>,
    sink: Arc<dyn OrderSink>,

    // Shutdown signal
    shutdown: Arc<watch::Sender<bool>>,
}

impl Bot {
    /// Create a new bot instance. Invalid configuration is fatal.
    pub fn new(
        config: BotConfig,
        db: Database,
        source: Arc<dyn TradeSource>,
        balances: Arc<dyn BalanceSource>,
        sink: Arc<dyn OrderSink>,
    ) -> Result<Self> {
        config.validate().context("Invalid bot configuration")?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            db,
            source,
            balances,
            sink,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Self account ledger at startup.
    ///
    /// Live values for the self address win; the persisted ledger fills in
    /// whatever the balance source cannot report.
    async fn initial_ledger(&self) -> Result<Ledger> {
        let persisted = self.db.load_ledger().await?;

        let Some(address) = &self.config.self_address else {
            return Ok(match persisted {
                Some(ledger) => {
                    info!(
                        cash = %ledger.cash(),
                        positions = ledger.positions().count(),
                        "Restored ledger from database"
                    );
                    ledger
                }
                None => Ledger::new(self.config.starting_balance),
            });
        };

        let fallback_cash = persisted
            .as_ref()
            .map(|l| l.cash())
            .unwrap_or(self.config.starting_balance);
        let cash = match self.balances.get(address).await {
            Ok(balance) => {
                info!(address = %address, balance = %balance, "Loaded self account balance");
                balance
            }
            Err(e) => {
                warn!(
                    address = %address,
                    error = %e,
                    fallback = %fallback_cash,
                    "Self balance unavailable, using last known cash"
                );
                fallback_cash
            }
        };

        let positions = match self.balances.positions(address).await {
            Ok(positions) => {
                info!(address = %address, positions = positions.len(), "Loaded self account holdings");
                positions
            }
            Err(e) => {
                let restored: Vec<_> = persisted
                    .map(|l| l.positions().cloned().collect())
                    .unwrap_or_default();
                warn!(
                    address = %address,
                    error = %e,
                    restored = restored.len(),
                    "Self holdings unavailable, using persisted positions"
                );
                restored
            }
        };

        Ok(Ledger::from_parts(cash, positions))
    }

    /// Run until shutdown, then return what was processed.
    pub async fn run(&mut self) -> Result<BotStats> {
        let wallets = self.db.get_active_targets().await?;
        let mut cursors = self.db.load_cursors().await?;

        info!(
            wallets = wallets.len(),
            resumed = cursors.len(),
            poll_interval = self.config.monitor.poll_interval_secs,
            "Starting bot run loop"
        );
        if wallets.is_empty() {
            warn!("No watched wallets; use `track <address>` first");
        }

        let mut stats = BotStats::default();
        for wallet in cursors.degraded() {
            if wallets.iter().any(|w| w == wallet) {
                warn!(wallet = %wallet, "Wallet was degraded at last shutdown");
                stats.degraded_wallets.insert(wallet.to_string());
            }
        }

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown.send(true);
            }
        });

        let monitor = Arc::new(ActivityMonitor::new(self.source.clone(), self.config.monitor.clone()));
        let (tx, mut rx) = mpsc::channel::<MonitorUpdate>(64);

        let mut tasks = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let cursor = cursors.take(&wallet);
            tasks.push(tokio::spawn(poll_wallet(
                monitor.clone(),
                wallet,
                cursor,
                tx.clone(),
                self.shutdown.subscribe(),
            )));
        }
        drop(tx);

        let engine = DecisionEngine::new(self.config.policy.clone());
        let estimator = TargetBalanceEstimator::new(self.balances.clone(), self.config.monitor.target_balance_refresh());
        let ledger = self.initial_ledger().await?;
        let mut pipeline = ExecutionPipeline::new(self.sink.clone(), self.config.retry.clone(), ledger);

        // Single consumer: the only writer of ledger state
        while let Some(update) = rx.recv().await {
            if let Err(e) = self
                .handle_update(update, &engine, &estimator, &mut pipeline, &mut stats)
                .await
            {
                error!(error = %e, "Failed to process wallet update");
            }
        }

        futures::future::join_all(tasks).await;

        stats.cash = pipeline.ledger().cash();
        stats.realized_pnl = pipeline.ledger().positions().map(|p| p.realized_pnl).sum();
        stats.open_positions = pipeline.ledger().positions().filter(|p| !p.is_flat()).count();

        info!("Bot shutdown complete");
        Ok(stats)
    }

    async fn handle_update(
        &self,
        update: MonitorUpdate,
        engine: &DecisionEngine,
        estimator: &TargetBalanceEstimator,
        pipeline: &mut ExecutionPipeline,
        stats: &mut BotStats,
    ) -> Result<()> {
        match update.health {
            WalletHealth::Degraded => stats.degraded_wallets.insert(update.wallet.clone()),
            WalletHealth::Healthy => stats.degraded_wallets.remove(&update.wallet),
        };
        if update.invalid {
            stats.invalid_wallets.insert(update.wallet.clone());
        }

        for event in &update.events {
            stats.events_seen += 1;
            let order = self.replicate(event, engine, estimator, pipeline).await;
            stats.record(&order);
            self.db.save_order(&update.wallet, &order).await?;

            if order.filled_size > Decimal::ZERO {
                if let Some(position) = pipeline.ledger().position(&order.market_id) {
                    self.db.save_position(position).await?;
                }
                self.db.save_cash(pipeline.ledger().cash()).await?;
            }
        }

        // Orders first: a crash in between re-polls rather than losing trades
        self.db.save_cursor(&update.wallet, &update.cursor).await?;

        Ok(())
    }

    /// Decide and execute one trade, returning the final order record.
    async fn replicate(
        &self,
        event: &TradeEvent,
        engine: &DecisionEngine,
        estimator: &TargetBalanceEstimator,
        pipeline: &mut ExecutionPipeline,
    ) -> ReplicationOrder {
        let target_estimate = if engine.config().scale_factor_override.is_some() {
            None
        } else {
            estimator.estimate(&event.wallet).await
        };
        let quote = pipeline.quote(&event.market_id, event.side).await;

        let decision = engine.decide(
            event,
            DecisionInput {
                self_balance: pipeline.ledger().cash(),
                target_balance_estimate: target_estimate,
                self_position: pipeline.ledger().position(&event.market_id),
                quote,
            },
        );

        match decision {
            Decision::Replicate(order) => {
                info!(
                    wallet = %event.wallet,
                    trade_id = %event.id,
                    market = %order.market_id,
                    side = %order.side,
                    size = %order.size,
                    source_size = %event.size,
                    "Replicating trade"
                );
                pipeline.execute(order).await.order
            }
            Decision::Skip(reason) => {
                info!(
                    wallet = %event.wallet,
                    trade_id = %event.id,
                    reason = %reason,
                    "Trade skipped"
                );
                ReplicationOrder::skipped(&event.id, &event.market_id, event.side, reason)
            }
        }
    }
}

/// Poll one wallet on its interval until shutdown.
async fn poll_wallet(
    monitor: Arc<ActivityMonitor>,
    wallet: String,
    mut cursor: WalletCursor,
    tx: mpsc::Sender<MonitorUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(monitor.config().poll_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let (events, invalid) = match monitor.poll(&wallet, &mut cursor).await {
            Ok(events) => (events, false),
            Err(SourceError::InvalidWallet(reason)) => {
                error!(wallet = %wallet, reason = %reason, "Invalid wallet, polling stopped");
                (Vec::new(), true)
            }
            // Logged by the monitor; retried next tick
            Err(SourceError::SourceUnavailable(_)) => (Vec::new(), false),
        };

        let update = MonitorUpdate {
            wallet: wallet.clone(),
            events,
            health: cursor.health,
            cursor: cursor.clone(),
            invalid,
        };
        if tx.send(update).await.is_err() || invalid {
            break;
        }
    }

    debug!(wallet = %wallet, "Poll task stopped");
}

/// Bot statistics.
#[derive(Debug, Clone, Default)]
pub struct BotStats {
    pub events_seen: u64,
    pub filled: u64,
    pub partially_filled: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cash: Decimal,
    pub realized_pnl: Decimal,
    pub open_positions: usize,
    pub degraded_wallets: BTreeSet<String>,
    pub invalid_wallets: BTreeSet<String>,
}

impl BotStats {
    fn record(&mut self, order: &ReplicationOrder) {
        match order.status {
            OrderStatus::Filled => self.filled += 1,
            OrderStatus::PartiallyFilled => self.partially_filled += 1,
            OrderStatus::Failed => self.failed += 1,
            OrderStatus::Skipped => self.skipped += 1,
            OrderStatus::Pending | OrderStatus::Submitted => {}
        }
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Trades Seen:     {}", self.events_seen)?;
        writeln!(
            f,
            "Orders:          {} filled, {} partial, {} failed, {} skipped",
            self.filled, self.partially_filled, self.failed, self.skipped
        )?;
        writeln!(f, "Cash:            ${:.2}", self.cash)?;
        writeln!(f, "Realized P&L:    ${:.2}", self.realized_pnl)?;
        writeln!(f, "Open Positions:  {}", self.open_positions)?;
        if !self.degraded_wallets.is_empty() {
            writeln!(f, "Degraded:        {:?}", self.degraded_wallets)?;
        }
        if !self.invalid_wallets.is_empty() {
            writeln!(f, "Invalid:         {:?}", self.invalid_wallets)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BalanceError, FetchCursor, PaperSink, QuoteSource};
    use crate::models::fixtures::event;
    use crate::models::{Position, TradeSide, WalletRole};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    type Script = Vec<Result<Vec<TradeEvent>, SourceError>>;

    /// Replays canned responses per wallet, one per fetch.
    struct ScriptedSource {
        responses: Mutex<HashMap<String, VecDeque<Result<Vec<TradeEvent>, SourceError>>>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<(&str, Script)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(wallet, script)| (wallet.to_string(), script.into()))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl TradeSource for ScriptedSource {
        async fn fetch_since(&self, wallet: &str, _cursor: FetchCursor) -> Result<Vec<TradeEvent>, SourceError> {
            self.responses
                .lock()
                .unwrap()
                .get_mut(wallet)
                .and_then(|script| script.pop_front())
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct FixedBalance {
        balance: Decimal,
        holdings: Option<Vec<Position>>,
    }

    fn balance(amount: Decimal) -> Arc<FixedBalance> {
        Arc::new(FixedBalance {
            balance: amount,
            holdings: None,
        })
    }

    #[async_trait]
    impl BalanceSource for FixedBalance {
        async fn get(&self, _wallet: &str) -> Result<Decimal, BalanceError> {
            Ok(self.balance)
        }

        async fn positions(&self, _wallet: &str) -> Result<Vec<Position>, BalanceError> {
            self.holdings
                .clone()
                .ok_or_else(|| BalanceError::Unavailable("no holdings".to_string()))
        }
    }

    struct FixedBook(Decimal);

    #[async_trait]
    impl QuoteSource for FixedBook {
        async fn best_price(&self, _market_id: &str, _side: TradeSide) -> Result<Option<Decimal>, SourceError> {
            Ok(Some(self.0))
        }
    }

    /// Database watching `wallets`, each already past its baseline.
    async fn tracked_db(wallets: &[&str]) -> Database {
        let db = Database::new("sqlite::memory:").await.unwrap();
        for wallet in wallets {
            db.track_wallet(wallet, WalletRole::Target).await.unwrap();
            let cursor = WalletCursor {
                baselined: true,
                ..Default::default()
            };
            db.save_cursor(wallet, &cursor).await.unwrap();
        }
        db
    }

    fn config(starting_balance: Decimal) -> BotConfig {
        BotConfig {
            starting_balance,
            policy: PolicyConfig {
                scale_factor_override: Some(dec!(1)),
                ..Default::default()
            },
            monitor: MonitorConfig {
                poll_interval_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn bot(responses: Script) -> Bot {
        let db = tracked_db(&["0xtarget"]).await;
        Bot::new(
            config(dec!(1000)),
            db,
            ScriptedSource::new(vec![("0xtarget", responses)]),
            balance(dec!(5000)),
            Arc::new(PaperSink::new(dec!(1))),
        )
        .unwrap()
    }

    /// Same database, new process: fresh source, sink and ledger.
    fn restart(db: Database, config: BotConfig, responses: Script, balances: Arc<FixedBalance>) -> Bot {
        Bot::new(
            config,
            db,
            ScriptedSource::new(vec![("0xtarget", responses)]),
            balances,
            Arc::new(PaperSink::new(dec!(1))),
        )
        .unwrap()
    }

    async fn run_briefly(bot: &mut Bot) -> BotStats {
        let shutdown = bot.shutdown_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = shutdown.send(true);
        });
        bot.run().await.unwrap()
    }

    #[tokio::test]
    async fn test_replicates_and_persists() {
        let trades = vec![
            event("t1", "m", TradeSide::Buy, dec!(10), dec!(0.50), 0),
            event("t2", "m", TradeSide::Sell, dec!(10), dec!(0.60), 5),
            event("t3", "n", TradeSide::Sell, dec!(10), dec!(0.60), 6),
        ];
        let mut bot = bot(vec![Ok(trades)]).await;

        let stats = run_briefly(&mut bot).await;

        assert_eq!(stats.events_seen, 3);
        assert_eq!(stats.filled, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.open_positions, 0);

        let orders = bot.db().get_recent_orders(10).await.unwrap();
        assert_eq!(orders.len(), 3);

        let cursor = bot.db().load_cursor("0xtarget").await.unwrap().unwrap();
        assert_eq!(cursor.last_id.as_deref(), Some("t3"));
        assert!(cursor.seen.contains("t1"));
    }

    #[tokio::test]
    async fn test_restart_does_not_replicate_twice() {
        let buy = event("t1", "m", TradeSide::Buy, dec!(10), dec!(0.50), 0);
        let mut bot = bot(vec![Ok(vec![buy.clone()])]).await;
        run_briefly(&mut bot).await;

        // Source replays the same trade
        let Bot { db, .. } = bot;
        let mut restarted = restart(db, config(dec!(1000)), vec![Ok(vec![buy])], balance(dec!(5000)));

        let stats = run_briefly(&mut restarted).await;
        assert_eq!(stats.events_seen, 0);
        assert_eq!(restarted.db().get_recent_orders(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newly_tracked_wallet_history_is_not_replicated() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.track_wallet("0xtarget", WalletRole::Target).await.unwrap();
        let history = vec![
            event("old1", "m", TradeSide::Buy, dec!(10), dec!(0.50), 0),
            event("old2", "n", TradeSide::Buy, dec!(10), dec!(0.40), 30),
        ];
        let mut bot = restart(db, config(dec!(1000)), vec![Ok(history)], balance(dec!(5000)));

        let stats = run_briefly(&mut bot).await;

        assert_eq!(stats.events_seen, 0);
        assert_eq!(stats.filled, 0);
        assert_eq!(stats.cash, dec!(1000));
        assert!(bot.db().get_recent_orders(10).await.unwrap().is_empty());

        let cursor = bot.db().load_cursor("0xtarget").await.unwrap().unwrap();
        assert!(cursor.baselined);
        assert_eq!(cursor.last_id.as_deref(), Some("old2"));
    }

    #[tokio::test]
    async fn test_restart_keeps_ledger() {
        let mut bot = bot(vec![Ok(vec![event("t1", "m", TradeSide::Buy, dec!(10), dec!(0.50), 0)])]).await;
        let first = run_briefly(&mut bot).await;
        assert_eq!(first.cash, dec!(994.9));

        // Without the persisted position this SELL would be skipped
        let Bot { db, .. } = bot;
        let sell = event("t2", "m", TradeSide::Sell, dec!(10), dec!(0.60), 5);
        let mut restarted = restart(db, config(dec!(1000)), vec![Ok(vec![sell])], balance(dec!(5000)));

        let stats = run_briefly(&mut restarted).await;

        assert_eq!(stats.filled, 1);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.open_positions, 0);
        assert_eq!(stats.cash, dec!(1000.78));
    }

    #[tokio::test]
    async fn test_self_holdings_seed_ledger() {
        let db = tracked_db(&["0xtarget"]).await;
        let held = Position::restore("m", dec!(10), dec!(0.40), Decimal::ZERO, Decimal::ZERO);
        let balances = Arc::new(FixedBalance {
            balance: dec!(5000),
            holdings: Some(vec![held]),
        });
        let config = BotConfig {
            self_address: Some("0xself".to_string()),
            ..config(dec!(1000))
        };
        let sell = event("t1", "m", TradeSide::Sell, dec!(10), dec!(0.60), 0);
        let mut bot = restart(db, config, vec![Ok(vec![sell])], balances);

        let stats = run_briefly(&mut bot).await;

        assert_eq!(stats.filled, 1);
        assert_eq!(stats.cash, dec!(5005.88));
        assert_eq!(stats.realized_pnl, dec!(1.88));
    }

    #[tokio::test]
    async fn test_wallets_share_one_ledger() {
        let db = tracked_db(&["0xa", "0xb"]).await;
        let buy = |id: &str, wallet: &str| TradeEvent {
            wallet: wallet.to_string(),
            ..event(id, "m", TradeSide::Buy, dec!(10), dec!(0.50), 0)
        };
        let source = ScriptedSource::new(vec![
            ("0xa", vec![Ok(vec![buy("a1", "0xa")])]),
            ("0xb", vec![Ok(vec![buy("b1", "0xb")])]),
        ]);
        // Room for one 10 @ 0.51 order, not two
        let mut bot = Bot::new(
            config(dec!(10)),
            db,
            source,
            balance(dec!(5000)),
            Arc::new(PaperSink::new(dec!(1))),
        )
        .unwrap();

        let stats = run_briefly(&mut bot).await;

        assert_eq!(stats.events_seen, 2);
        assert_eq!(stats.filled, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.cash, dec!(4.9));

        let orders = bot.db().get_recent_orders(10).await.unwrap();
        let skipped: Vec<_> = orders.iter().filter(|o| o.status == "SKIPPED").collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].skip_reason.as_deref(), Some("INSUFFICIENT_BALANCE"));
    }

    #[tokio::test]
    async fn test_live_quote_outside_tolerance_skips() {
        let db = tracked_db(&["0xtarget"]).await;
        let sink = PaperSink::new(dec!(1)).with_quotes(Arc::new(FixedBook(dec!(0.60))));
        let buy = event("t1", "m", TradeSide::Buy, dec!(10), dec!(0.50), 0);
        let mut bot = Bot::new(
            config(dec!(1000)),
            db,
            ScriptedSource::new(vec![("0xtarget", vec![Ok(vec![buy])])]),
            balance(dec!(5000)),
            Arc::new(sink),
        )
        .unwrap();

        let stats = run_briefly(&mut bot).await;

        assert_eq!(stats.skipped, 1);
        let orders = bot.db().get_recent_orders(10).await.unwrap();
        assert_eq!(orders[0].skip_reason.as_deref(), Some("SLIPPAGE_EXCEEDED"));
    }

    #[tokio::test]
    async fn test_degraded_wallet_is_reported() {
        let db = tracked_db(&[]).await;
        db.track_wallet("0xtarget", WalletRole::Target).await.unwrap();
        let cursor = WalletCursor {
            baselined: true,
            consecutive_failures: 5,
            health: WalletHealth::Degraded,
            ..Default::default()
        };
        db.save_cursor("0xtarget", &cursor).await.unwrap();

        let unavailable = Err(SourceError::SourceUnavailable("down".to_string()));
        let mut bot = restart(db, config(dec!(1000)), vec![unavailable], balance(dec!(5000)));

        let stats = run_briefly(&mut bot).await;
        assert!(stats.degraded_wallets.contains("0xtarget"));
    }

    #[tokio::test]
    async fn test_invalid_wallet_is_reported() {
        let mut bot = bot(vec![Err(SourceError::InvalidWallet("0xtarget".to_string()))]).await;
        let stats = run_briefly(&mut bot).await;
        assert!(stats.invalid_wallets.contains("0xtarget"));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = BotConfig {
            policy: PolicyConfig {
                min_order_size: dec!(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
