//! Wallet Mirror
//!
//! Replicates trades of watched prediction-market wallets onto a controlled
//! account, discovers active wallets, and backtests candidates through the
//! same sizing policy.

mod api;
mod backtest;
mod bot;
mod db;
mod discovery;
mod metrics;
mod models;
mod trading;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BookClient, DataClient, PaperSink};
use crate::backtest::{sweep, BacktestConfig, BacktestError, Simulator};
use crate::bot::{Bot, BotConfig};
use crate::db::Database;
use crate::discovery::{DiscoveryConfig, WalletScorer};
use crate::models::Wallet;
use crate::trading::{MonitorConfig, PolicyConfig, RetryConfig};

/// Wallet trade replication CLI.
#[derive(Parser)]
#[command(name = "wallet-mirror")]
#[command(about = "Mirror trades of watched wallets and backtest candidates", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./wallet_mirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Override the Data API base URL
    #[arg(long, env = "DATA_API_URL")]
    data_api: Option<String>,

    /// Override the CLOB order book base URL
    #[arg(long, env = "CLOB_API_URL")]
    clob_api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a wallet to watch
    Track {
        /// Wallet address
        address: String,
    },

    /// Stop watching a wallet
    Untrack {
        /// Wallet address
        address: String,
    },

    /// List watched wallets
    List,

    /// Replicate trades of all watched wallets until Ctrl+C
    Run {
        /// Self account address, used to read the live balance
        #[arg(long, env = "SELF_ADDRESS")]
        self_address: Option<String>,

        /// Starting cash when the self balance cannot be read
        #[arg(short, long, default_value = "1000")]
        balance: Decimal,

        /// Poll interval in seconds
        #[arg(short, long, default_value = "30")]
        interval: u64,

        /// Fixed scale factor instead of the balance ratio
        #[arg(short, long)]
        scale: Option<Decimal>,

        /// Minimum order size in tokens
        #[arg(long, default_value = "1")]
        min_size: Decimal,

        /// Maximum order size in tokens
        #[arg(long, default_value = "1000")]
        max_size: Decimal,

        /// Maximum tolerated slippage as a fraction (0.02 = 2%)
        #[arg(long, default_value = "0.02")]
        slippage: Decimal,

        /// Retries after the first submission attempt
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },

    /// Replay wallet history through the replication policy
    Backtest {
        /// Wallet address to backtest
        #[arg(short, long, conflicts_with = "all")]
        wallet: Option<String>,

        /// Backtest all watched wallets
        #[arg(short, long)]
        all: bool,

        /// Starting balance in USD
        #[arg(short, long, default_value = "10000")]
        balance: Decimal,

        /// Number of historical trades per wallet
        #[arg(long, default_value = "500")]
        lookback: u32,

        /// Simulated adverse price move per fill as a fraction
        #[arg(long, default_value = "0")]
        slippage: Decimal,

        /// Fixed scale factor instead of the balance ratio
        #[arg(short, long)]
        scale: Option<Decimal>,

        /// Assumed target balance for the balance ratio
        #[arg(short, long)]
        target_balance: Option<Decimal>,

        /// Compare several scale factors on one wallet (comma separated)
        #[arg(long, value_delimiter = ',', requires = "wallet")]
        sweep: Vec<Decimal>,
    },

    /// Find wallets active in recent market-wide trades
    Discover {
        /// Hours of recent trades to scan
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Maximum number of wallets to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Minimum trades in the window for a wallet to be scored
        #[arg(long, default_value = "5")]
        min_trades: usize,

        /// Upper bound on trade pages fetched
        #[arg(long, default_value = "20")]
        max_pages: u32,

        /// Backtest and store the top N wallets
        #[arg(long, default_value = "0")]
        backtest_top: usize,

        /// Track the top N wallets for replication
        #[arg(long, default_value = "0")]
        track_top: usize,
    },

    /// Rank backtested wallets by P&L
    Rank {
        /// Maximum number of wallets to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show recent replication orders
    Orders {
        /// Maximum number of orders to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;

    match cli.command {
        Commands::Track { address } => {
            let wallet = Wallet::target(address);
            db.track_wallet(wallet.address(), wallet.role()).await?;
            println!("Now watching wallet: {}", wallet);
        }

        Commands::Untrack { address } => {
            let wallet = Wallet::target(address);
            if db.untrack_wallet(wallet.address()).await? {
                println!("Stopped watching wallet: {}", wallet);
            } else {
                println!("Wallet {} was not being watched", wallet);
            }
        }

        Commands::List => {
            let wallets = db.list_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets being watched. Use 'wallet-mirror track <address>' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<44} {:<8} {:<8} {:<20} {:<26} {}",
                "Address", "Role", "Active", "Added", "Last Trade", "Health"
            );
            println!("{}", "-".repeat(120));
            for w in wallets {
                let cursor = db.load_cursor(&w.address).await?;
                let last_trade = cursor
                    .as_ref()
                    .and_then(|c| c.last_timestamp)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let health = cursor
                    .map(|c| format!("{:?}", c.health).to_lowercase())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<44} {:<8} {:<8} {:<20} {:<26} {}",
                    w.address,
                    w.role,
                    if w.is_active { "yes" } else { "no" },
                    truncate(&w.added_at, 20),
                    last_trade,
                    health
                );
            }
        }

        Commands::Run {
            self_address,
            balance,
            interval,
            scale,
            min_size,
            max_size,
            slippage,
            max_retries,
        } => {
            let targets = db.get_active_targets().await?;
            if targets.is_empty() {
                println!("No wallets being watched. Use 'wallet-mirror track <address>' first.");
                return Ok(());
            }

            let self_account = self_address.map(Wallet::self_account);
            if let Some(account) = &self_account {
                db.track_wallet(account.address(), account.role()).await?;
            }

            let config = BotConfig {
                self_address: self_account.map(|a| a.address().to_string()),
                starting_balance: balance,
                policy: PolicyConfig {
                    scale_factor_override: scale,
                    min_order_size: min_size,
                    max_order_size: max_size,
                    max_slippage_pct: slippage,
                },
                retry: RetryConfig {
                    max_retry_attempts: max_retries,
                    ..RetryConfig::default()
                },
                monitor: MonitorConfig {
                    poll_interval_secs: interval,
                    ..MonitorConfig::default()
                },
            };

            let client = Arc::new(data_client(cli.data_api.as_deref())?);
            let book = Arc::new(book_client(cli.clob_api.as_deref())?);
            let sink = Arc::new(PaperSink::new(min_size).with_quotes(book));

            println!("\n=== Wallet Mirror ===");
            println!("Watched wallets: {}", targets.len());
            println!("Polling interval: {}s", interval);
            match scale {
                Some(s) => println!("Scale factor: {} (fixed)", s),
                None => println!("Scale factor: self/target balance ratio"),
            }
            println!("Mode: DRY RUN (paper fills at live book prices)");
            println!("\nPress Ctrl+C to stop.\n");

            let mut bot = Bot::new(config, db, client.clone(), client, sink)?;
            let stats = bot.run().await?;
            println!("\n{}", stats);
        }

        Commands::Backtest {
            wallet,
            all,
            balance,
            lookback,
            slippage,
            scale,
            target_balance,
            sweep: scales,
        } => {
            let config = BacktestConfig {
                starting_balance: balance,
                policy: PolicyConfig {
                    scale_factor_override: scale,
                    ..PolicyConfig::default()
                },
                target_balance,
                simulated_slippage: slippage,
                lookback_trades: lookback,
            };
            let simulator = Simulator::new(config.clone())?;
            let client = data_client(cli.data_api.as_deref())?;

            let wallets = if all {
                db.get_active_targets().await?
            } else if let Some(address) = wallet {
                vec![Wallet::target(address).address().to_string()]
            } else {
                println!("Specify --wallet <address> or --all");
                return Ok(());
            };

            if wallets.is_empty() {
                println!("No wallets being watched. Use 'wallet-mirror track <address>' first.");
                return Ok(());
            }

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                });
            }

            println!("\n=== Backtest ===");
            println!("Wallets: {}", wallets.len());
            println!("Capital: ${}", balance);
            println!("Lookback: {} trades per wallet", lookback);
            println!("Slippage: {}%", slippage * dec!(100));
            println!("\nFetching historical data...\n");

            if !scales.is_empty() {
                let address = &wallets[0];
                let history = client.get_history(address, lookback).await?;
                let policies: Vec<PolicyConfig> = scales
                    .iter()
                    .map(|s| PolicyConfig {
                        scale_factor_override: Some(*s),
                        ..config.policy.clone()
                    })
                    .collect();
                let results = sweep(&config, &policies, address, &history)?;

                println!("{:<10} {:>12} {:>10} {:>12} {:>8}", "Scale", "P&L", "Win Rate", "Max DD", "Sharpe");
                println!("{}", "-".repeat(56));
                for (s, r) in scales.iter().zip(&results) {
                    println!(
                        "{:<10} {:>12.2} {:>9.1}% {:>12.2} {:>8.2}",
                        s,
                        r.realized_pnl,
                        r.win_rate * 100.0,
                        r.max_drawdown,
                        r.sharpe_ratio
                    );
                }
                return Ok(());
            }

            for address in &wallets {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }

                let history = match client.get_history(address, lookback).await {
                    Ok(history) => history,
                    Err(e) => {
                        warn!(wallet = %address, error = %e, "Failed to fetch history");
                        continue;
                    }
                };

                match simulator.simulate_until(address, &history, &cancel) {
                    Ok(result) => {
                        println!("{}", result);
                        db.save_backtest_result(&result).await?;
                    }
                    Err(BacktestError::EmptyHistory(_)) => {
                        println!("No trade history for {}", address);
                    }
                    Err(BacktestError::Cancelled { processed }) => {
                        println!("\nBacktest cancelled after {} events.", processed);
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Commands::Discover {
            hours,
            limit,
            min_trades,
            max_pages,
            backtest_top,
            track_top,
        } => {
            let client = data_client(cli.data_api.as_deref())?;
            let since = Utc::now() - chrono::Duration::hours(hours);

            println!("\n=== Wallet Discovery ===");
            println!("Window: last {}h", hours);
            println!("\nFetching recent trades...\n");

            let trades = client.get_recent_since(since, max_pages).await?;
            let scorer = WalletScorer::new(DiscoveryConfig {
                min_trades,
                ..DiscoveryConfig::default()
            });
            let ranked = scorer.score(&trades);
            info!(trades = trades.len(), candidates = ranked.len(), "Scored active wallets");

            if ranked.is_empty() {
                println!("No wallet made {} or more trades in the window.", min_trades);
                return Ok(());
            }

            println!(
                "{:<4} {:<44} {:>8} {:>8} {:>12} {:>8}",
                "#", "Wallet", "Trades", "Markets", "Volume", "Score"
            );
            println!("{}", "-".repeat(90));
            for (i, w) in ranked.iter().take(limit).enumerate() {
                println!(
                    "{:<4} {:<44} {:>8} {:>8} {:>12.2} {:>8.3}",
                    i + 1,
                    truncate(&w.wallet, 44),
                    w.trade_count,
                    w.unique_markets,
                    w.volume,
                    w.activity_score
                );
            }

            for w in ranked.iter().take(track_top) {
                let wallet = Wallet::target(&w.wallet);
                db.track_wallet(wallet.address(), wallet.role()).await?;
                println!("Now watching wallet: {}", wallet);
            }

            if backtest_top > 0 {
                let config = BacktestConfig::default();
                let simulator = Simulator::new(config.clone())?;
                println!("\nBacktesting top {} wallets...\n", backtest_top.min(ranked.len()));

                for w in ranked.iter().take(backtest_top) {
                    let history = match client.get_history(&w.wallet, config.lookback_trades).await {
                        Ok(history) => history,
                        Err(e) => {
                            warn!(wallet = %w.wallet, error = %e, "Failed to fetch history");
                            continue;
                        }
                    };

                    match simulator.simulate(&w.wallet, &history) {
                        Ok(result) => {
                            println!("{}", result);
                            db.save_backtest_result(&result).await?;
                        }
                        Err(BacktestError::EmptyHistory(_)) => println!("No trade history for {}", w.wallet),
                        Err(e) => return Err(e.into()),
                    }
                }
                println!("Use 'wallet-mirror rank' to compare stored results.");
            }
        }

        Commands::Rank { limit } => {
            let results = db.rank_backtest_results(limit).await?;
            if results.is_empty() {
                println!("No backtest results. Use 'wallet-mirror backtest' first.");
                return Ok(());
            }

            println!(
                "\n{:<4} {:<44} {:>12} {:>12} {:>8} {:>10} {:>8}",
                "#", "Wallet", "P&L", "Final", "Win %", "Max DD", "Sharpe"
            );
            println!("{}", "-".repeat(105));
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{:<4} {:<44} {:>12.2} {:>12.2} {:>7.1}% {:>10.2} {:>8.2}",
                    i + 1,
                    truncate(&r.wallet, 44),
                    r.realized_pnl(),
                    r.final_balance(),
                    r.win_rate * 100.0,
                    r.max_drawdown(),
                    r.sharpe_ratio
                );
            }
        }

        Commands::Orders { limit } => {
            let orders = db.get_recent_orders(limit).await?;
            if orders.is_empty() {
                println!("No replication orders recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<14} {:<5} {:>10} {:>10} {:<17} {}",
                "Time", "Market", "Side", "Size", "Filled", "Status", "Note"
            );
            println!("{}", "-".repeat(100));
            for o in &orders {
                let note = o.skip_reason.as_deref().or(o.error.as_deref()).unwrap_or("");
                println!(
                    "{:<20} {:<14} {:<5} {:>10} {:>10} {:<17} {}",
                    truncate(&o.created_at, 20),
                    truncate(&o.market_id, 14),
                    o.side,
                    o.size,
                    o.filled_size,
                    o.status,
                    truncate(note, 30)
                );
            }

            println!("\n--- Totals ---");
            for (status, count) in db.get_order_stats().await? {
                println!("  {:<17} {}", status, count);
            }
        }

        Commands::Config => {
            let defaults = serde_json::json!({
                "policy": PolicyConfig::default(),
                "retry": RetryConfig::default(),
                "monitor": MonitorConfig::default(),
                "backtest": BacktestConfig::default(),
                "discovery": DiscoveryConfig::default(),
            });
            println!("{}", serde_json::to_string_pretty(&defaults)?);
        }
    }

    info!("Done");
    Ok(())
}

fn data_client(base_url: Option<&str>) -> Result<DataClient> {
    match base_url {
        Some(url) => DataClient::with_base_url(url.to_string()),
        None => DataClient::new(),
    }
    .context("Failed to build Data API client")
}

fn book_client(base_url: Option<&str>) -> Result<BookClient> {
    match base_url {
        Some(url) => BookClient::with_base_url(url.to_string()),
        None => BookClient::new(),
    }
    .context("Failed to build order book client")
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0x1234567890abcdef", 10), "0x12345...");
    }

    #[test]
    fn test_cli_parses_backtest_sweep() {
        let cli = Cli::try_parse_from([
            "wallet-mirror",
            "backtest",
            "--wallet",
            "0xabc",
            "--sweep",
            "0.05,0.1,0.2",
        ])
        .unwrap();
        match cli.command {
            Commands::Backtest { wallet, sweep, .. } => {
                assert_eq!(wallet.as_deref(), Some("0xabc"));
                assert_eq!(sweep, vec![dec!(0.05), dec!(0.1), dec!(0.2)]);
            }
            _ => panic!("expected backtest"),
        }
    }

    #[test]
    fn test_cli_parses_discover() {
        let cli = Cli::try_parse_from(["wallet-mirror", "discover", "--hours", "6", "--backtest-top", "3"]).unwrap();
        match cli.command {
            Commands::Discover {
                hours,
                min_trades,
                backtest_top,
                track_top,
                ..
            } => {
                assert_eq!(hours, 6);
                assert_eq!(min_trades, 5);
                assert_eq!(backtest_top, 3);
                assert_eq!(track_top, 0);
            }
            _ => panic!("expected discover"),
        }
    }

    #[test]
    fn test_cli_rejects_wallet_with_all() {
        assert!(Cli::try_parse_from(["wallet-mirror", "backtest", "--wallet", "0xabc", "--all"]).is_err());
    }
}
