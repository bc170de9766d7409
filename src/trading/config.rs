//! Replication, retry, and monitoring configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration. Always fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("scale factor override must be positive, got {0}")]
    InvalidScaleFactor(Decimal),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },

    #[error("min_order_size {min} exceeds max_order_size {max}")]
    InvertedBounds { min: Decimal, max: Decimal },

    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: Decimal },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("max_slippage_pct must be below 1, got {0}")]
    SlippageOutOfRange(Decimal),
}

/// Sizing and pricing policy shared by live replication and backtests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Fixed self/target ratio; when set it replaces the balance ratio
    pub scale_factor_override: Option<Decimal>,

    /// Minimum order size in tokens (smaller orders are clamped up)
    pub min_order_size: Decimal,

    /// Maximum order size in tokens
    pub max_order_size: Decimal,

    /// Slippage tolerance relative to the observed price (0.02 = 2%)
    pub max_slippage_pct: Decimal,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            scale_factor_override: None,
            min_order_size: dec!(1),
            max_order_size: dec!(1000),
            max_slippage_pct: dec!(0.02),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(scale) = self.scale_factor_override {
            if scale <= Decimal::ZERO {
                return Err(ConfigError::InvalidScaleFactor(scale));
            }
        }
        positive("min_order_size", self.min_order_size)?;
        positive("max_order_size", self.max_order_size)?;
        if self.min_order_size > self.max_order_size {
            return Err(ConfigError::InvertedBounds {
                min: self.min_order_size,
                max: self.max_order_size,
            });
        }
        non_negative("max_slippage_pct", self.max_slippage_pct)?;
        // A SELL limit of price * (1 - pct) must stay above zero
        if self.max_slippage_pct >= Decimal::ONE {
            return Err(ConfigError::SlippageOutOfRange(self.max_slippage_pct));
        }
        Ok(())
    }
}

/// Submission retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-submissions allowed after the first attempt
    pub max_retry_attempts: u32,

    /// First backoff interval (ms)
    pub initial_backoff_ms: u64,

    /// Backoff ceiling (ms)
    pub max_backoff_ms: u64,

    /// Deadline for a single submission (ms)
    pub submit_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            submit_timeout_ms: 15_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.submit_timeout_ms == 0 {
            return Err(ConfigError::Zero("submit_timeout"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvertedBounds {
                min: Decimal::from(self.initial_backoff_ms),
                max: Decimal::from(self.max_backoff_ms),
            });
        }
        Ok(())
    }
}

/// Wallet polling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Polling interval per wallet (seconds)
    pub poll_interval_secs: u64,

    /// Maximum ids kept in each wallet's seen window
    pub dedup_window_size: usize,

    /// Seen ids older than this behind the newest trade are pruned (seconds)
    pub max_lag_secs: i64,

    /// Consecutive fetch failures before a wallet is degraded
    pub degraded_after_failures: u32,

    /// Minimum time between target balance lookups (seconds)
    pub target_balance_refresh_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            dedup_window_size: 1024,
            max_lag_secs: 3600,
            degraded_after_failures: 5,
            target_balance_refresh_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_lag(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_lag_secs)
    }

    pub fn target_balance_refresh(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.target_balance_refresh_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.dedup_window_size == 0 {
            return Err(ConfigError::Zero("dedup_window_size"));
        }
        if self.degraded_after_failures == 0 {
            return Err(ConfigError::Zero("degraded_after_failures"));
        }
        if self.max_lag_secs <= 0 {
            return Err(ConfigError::Zero("max_lag"));
        }
        Ok(())
    }
}

pub(crate) fn positive(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO {
        return Err(ConfigError::NonPositive { field, value });
    }
    Ok(())
}

pub(crate) fn non_negative(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value < Decimal::ZERO {
        return Err(ConfigError::Negative { field, value });
    }
    Ok(())
}
