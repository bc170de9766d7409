//! Trading logic: sizing, decisions, wallet monitoring, order execution.

mod balance;
mod config;
mod decision;
mod executor;
mod monitor;
mod position_sizer;

pub use balance::TargetBalanceEstimator;
pub use config::{ConfigError, MonitorConfig, PolicyConfig, RetryConfig};
pub use decision::{price_limit, slippage, DecisionEngine, DecisionInput};
pub use executor::{ExecutionPipeline, ExecutionReport, Ledger, RetryState};
pub use monitor::{ActivityMonitor, CursorStore, SeenWindow, WalletCursor, WalletHealth};
pub use position_sizer::{PositionSizer, ScaleSource};

pub(crate) use config::{non_negative, positive};
