//! Wallet activity monitor: polls a trade source, deduplicates, orders.
//!
//! Per-wallet state lives in a [`WalletCursor`] owned by the caller (see
//! [`CursorStore`]), so live polling and tests drive the same code with
//! explicit state. Cursors serialize for persistence across restarts.
//!
//! A wallet's first successful poll only records a baseline: trades that
//! already happened before tracking started are marked seen, not emitted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::{FetchCursor, SourceError, TradeSource};
use crate::models::TradeEvent;

use super::MonitorConfig;

/// Polling health of a watched wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletHealth {
    #[default]
    Healthy,
    Degraded,
}

/// A consumed trade id and when it traded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    id: String,
    timestamp: DateTime<Utc>,
}

/// Bounded set of recently consumed trade ids, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<SeenEntry>", into = "Vec<SeenEntry>")]
pub struct SeenWindow {
    entries: VecDeque<SeenEntry>,
    ids: HashSet<String>,
}

impl From<Vec<SeenEntry>> for SeenWindow {
    fn from(entries: Vec<SeenEntry>) -> Self {
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        Self {
            entries: entries.into(),
            ids,
        }
    }
}

impl From<SeenWindow> for Vec<SeenEntry> {
    fn from(window: SeenWindow) -> Self {
        window.entries.into()
    }
}

impl SeenWindow {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record `id`, evicting the oldest entries beyond `capacity`.
    pub fn insert(&mut self, id: &str, timestamp: DateTime<Utc>, capacity: usize) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.entries.push_back(SeenEntry {
            id: id.to_string(),
            timestamp,
        });
        while self.entries.len() > capacity {
            self.evict_front();
        }
    }

    /// Drop entries older than `newest - max_lag`.
    pub fn prune(&mut self, newest: DateTime<Utc>, max_lag: Duration) {
        let horizon = newest - max_lag;
        while self.entries.front().is_some_and(|e| e.timestamp < horizon) {
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.ids.remove(&entry.id);
        }
    }
}

/// Per-wallet polling position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCursor {
    /// Newest trade timestamp consumed
    pub last_timestamp: Option<DateTime<Utc>>,

    /// Id of the last trade consumed
    pub last_id: Option<String>,

    /// Recently consumed ids
    pub seen: SeenWindow,

    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default)]
    pub health: WalletHealth,

    /// Set once the pre-existing history has been skipped
    #[serde(default)]
    pub baselined: bool,
}

impl WalletCursor {
    fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let degraded = self.consecutive_failures >= threshold;
        let changed = degraded && self.health == WalletHealth::Healthy;
        if degraded {
            self.health = WalletHealth::Degraded;
        }
        changed
    }

    fn record_success(&mut self) -> bool {
        let recovered = self.health == WalletHealth::Degraded;
        self.consecutive_failures = 0;
        self.health = WalletHealth::Healthy;
        recovered
    }
}

/// Explicit keyed store of wallet cursors.
#[derive(Debug, Clone, Default)]
pub struct CursorStore {
    cursors: HashMap<String, WalletCursor>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the cursor for `wallet`, or a fresh one.
    pub fn take(&mut self, wallet: &str) -> WalletCursor {
        self.cursors.remove(wallet).unwrap_or_default()
    }

    pub fn insert(&mut self, wallet: impl Into<String>, cursor: WalletCursor) {
        self.cursors.insert(wallet.into(), cursor);
    }

    pub fn degraded(&self) -> Vec<&str> {
        self.cursors
            .iter()
            .filter(|(_, c)| c.health == WalletHealth::Degraded)
            .map(|(w, _)| w.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }
}

/// Polls a trade source and emits each wallet's new trades exactly once.
pub struct ActivityMonitor {
    source: Arc<dyn TradeSource>,
    config: MonitorConfig,
}

impl ActivityMonitor {
    pub fn new(source: Arc<dyn TradeSource>, config: MonitorConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Fetch new trades for `wallet`, in (timestamp, id) order.
    ///
    /// On failure the cursor position is left untouched; only the failure
    /// count and health change.
    pub async fn poll(&self, wallet: &str, cursor: &mut WalletCursor) -> Result<Vec<TradeEvent>, SourceError> {
        let fetch = FetchCursor {
            since: cursor.last_timestamp,
        };

        let fetched = match self.source.fetch_since(wallet, fetch).await {
            Ok(events) => events,
            Err(e) => {
                if matches!(e, SourceError::SourceUnavailable(_)) {
                    let newly_degraded = cursor.record_failure(self.config.degraded_after_failures);
                    warn!(
                        wallet = %wallet,
                        failures = cursor.consecutive_failures,
                        error = %e,
                        "Trade fetch failed"
                    );
                    if newly_degraded {
                        error!(
                            wallet = %wallet,
                            failures = cursor.consecutive_failures,
                            "Wallet degraded after repeated fetch failures"
                        );
                    }
                }
                return Err(e);
            }
        };

        if cursor.record_success() {
            info!(wallet = %wallet, "Wallet recovered");
        }

        if !cursor.baselined {
            cursor.baselined = true;
            if cursor.last_timestamp.is_none() {
                self.record_baseline(wallet, cursor, fetched);
                return Ok(Vec::new());
            }
        }

        let mut fresh = Vec::with_capacity(fetched.len());
        for event in fetched {
            if cursor.seen.contains(&event.id) {
                debug!(wallet = %wallet, trade_id = %event.id, "Duplicate trade dropped");
                continue;
            }
            if cursor.last_timestamp.is_some_and(|last| event.timestamp < last) {
                debug!(
                    wallet = %wallet,
                    trade_id = %event.id,
                    timestamp = %event.timestamp,
                    "Late trade dropped"
                );
                continue;
            }
            fresh.push(event);
        }

        fresh.sort_by(|a, b| a.replay_order(b));
        fresh.dedup_by(|a, b| a.id == b.id);

        for event in &fresh {
            cursor
                .seen
                .insert(&event.id, event.timestamp, self.config.dedup_window_size);
        }

        if let Some(newest) = fresh.last() {
            cursor.last_timestamp = Some(newest.timestamp);
            cursor.last_id = Some(newest.id.clone());
            cursor.seen.prune(newest.timestamp, self.config.max_lag());
        }

        if !fresh.is_empty() {
            debug!(wallet = %wallet, count = fresh.len(), "New trades observed");
        }

        Ok(fresh)
    }

    /// Mark existing history as consumed without emitting it.
    fn record_baseline(&self, wallet: &str, cursor: &mut WalletCursor, mut history: Vec<TradeEvent>) {
        history.sort_by(|a, b| a.replay_order(b));

        for event in &history {
            cursor
                .seen
                .insert(&event.id, event.timestamp, self.config.dedup_window_size);
        }

        if let Some(newest) = history.last() {
            cursor.last_timestamp = Some(newest.timestamp);
            cursor.last_id = Some(newest.id.clone());
            cursor.seen.prune(newest.timestamp, self.config.max_lag());
        }

        info!(
            wallet = %wallet,
            skipped = history.len(),
            remembered = cursor.seen.len(),
            since = ?cursor.last_timestamp,
            "Baseline recorded, earlier trades not replicated"
        );
    }
}
