//! Target wallet balance estimation for proportional sizing.
//!
//! Balances are polled from a [`BalanceSource`] at most once per refresh
//! interval per wallet. When a lookup fails the last known value is reused.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::BalanceSource;

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    value: Decimal,
    fetched_at: DateTime<Utc>,
}

/// Cached, rate-limited view of target wallet balances.
pub struct TargetBalanceEstimator {
    source: Arc<dyn BalanceSource>,
    refresh: Duration,
    cache: RwLock<HashMap<String, CachedBalance>>,
}

impl TargetBalanceEstimator {
    pub fn new(source: Arc<dyn BalanceSource>, refresh: Duration) -> Self {
        Self {
            source,
            refresh,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current estimate for `wallet`, refreshing when stale.
    pub async fn estimate(&self, wallet: &str) -> Option<Decimal> {
        self.estimate_at(wallet, Utc::now()).await
    }

    pub async fn estimate_at(&self, wallet: &str, now: DateTime<Utc>) -> Option<Decimal> {
        let cached = self.cache.read().await.get(wallet).copied();

        if let Some(entry) = cached {
            if now - entry.fetched_at < self.refresh {
                return Some(entry.value);
            }
        }

        match self.source.get(wallet).await {
            Ok(value) => {
                debug!(wallet = %wallet, balance = %value, "Refreshed target balance");
                self.cache.write().await.insert(
                    wallet.to_string(),
                    CachedBalance {
                        value,
                        fetched_at: now,
                    },
                );
                Some(value)
            }
            Err(e) => {
                match cached {
                    Some(entry) => warn!(
                        wallet = %wallet,
                        error = %e,
                        stale_since = %entry.fetched_at,
                        "Balance lookup failed, using stale estimate"
                    ),
                    None => warn!(wallet = %wallet, error = %e, "Balance lookup failed, no estimate"),
                }
                cached.map(|entry| entry.value)
            }
        }
    }
}
