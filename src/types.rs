// =============================================================================
// Shared types used across the volatility harvester
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single tick from the feed. Transient — never persisted.
///
/// `exchange_timestamp` is the authoritative ordering key; it is whatever the
/// feed stamped the trade with, not the time it was received locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub token: u64,
    pub last_price: f64,
    pub exchange_timestamp: DateTime<Utc>,
}

/// Per-window, per-instrument OHLC accumulator.
///
/// Invariant: `low <= min(open, close) <= max(open, close) <= high`.
/// `tick_count >= 1` unless `gap_filled`, in which case
/// `open == high == low == close` and `tick_count == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_count: u32,
    pub gap_filled: bool,
}

impl OhlcBar {
    pub fn first_tick(window_start: DateTime<Utc>, price: f64) -> Self {
        Self {
            window_start,
            open: price,
            high: price,
            low: price,
            close: price,
            tick_count: 1,
            gap_filled: false,
        }
    }

    pub fn apply_tick(&mut self, price: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.tick_count += 1;
    }

    pub fn flat(window_start: DateTime<Utc>, last_close: f64) -> Self {
        Self {
            window_start,
            open: last_close,
            high: last_close,
            low: last_close,
            close: last_close,
            tick_count: 0,
            gap_filled: true,
        }
    }

    /// True if the OHLC invariant holds. Violations are warned on, never fatal.
    pub fn invariant_holds(&self) -> bool {
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }
}

/// An OHLC bar enriched with identity and volatility fields, ready to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedBar {
    pub row_id: String,
    pub symbol: String,
    pub segment: String,
    pub bar: OhlcBar,
    pub tr: f64,
    pub atr: Option<f64>,
}

/// A batch of enriched bars for one window, queued for the writer.
///
/// `atr_rows` carries the full `atr_state` "latest view" snapshot taken at
/// enqueue time, so the writer can overwrite that table immediately after
/// this batch's market-data append is confirmed, without reaching back into
/// the scheduler's ATR engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBatch {
    pub window_start: DateTime<Utc>,
    pub rows: Vec<EnrichedBar>,
    pub atr_rows: Vec<serde_json::Value>,
}

impl WriteBatch {
    pub fn row_ids(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.row_id.clone()).collect()
    }

    pub fn expected_count(&self) -> usize {
        self.rows.len()
    }
}

/// Severity used for both process-log routing and store log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Info
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Source of the ATR state adopted by startup reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationSource {
    Fresh,
    Local,
    Sheets,
    Consistent,
}

impl Default for ReconciliationSource {
    fn default() -> Self {
        Self::Fresh
    }
}

impl std::fmt::Display for ReconciliationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Local => write!(f, "local"),
            Self::Sheets => write!(f, "sheets"),
            Self::Consistent => write!(f, "consistent"),
        }
    }
}

/// Window lifecycle state, shared by the aggregator and its tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    Idle,
    Collecting,
    Freezing,
    Frozen,
}

impl Default for WindowState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for WindowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Collecting => write!(f, "COLLECTING"),
            Self::Freezing => write!(f, "FREEZING"),
            Self::Frozen => write!(f, "FROZEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_invariant_holds_for_first_tick() {
        let bar = OhlcBar::first_tick(Utc::now(), 100.0);
        assert!(bar.invariant_holds());
        assert_eq!(bar.tick_count, 1);
    }

    #[test]
    fn bar_invariant_holds_after_ticks() {
        let mut bar = OhlcBar::first_tick(Utc::now(), 100.0);
        bar.apply_tick(99.0);
        bar.apply_tick(101.0);
        bar.apply_tick(100.5);
        assert!(bar.invariant_holds());
        assert_eq!(bar.low, 99.0);
        assert_eq!(bar.high, 101.0);
        assert_eq!(bar.close, 100.5);
        assert_eq!(bar.tick_count, 4);
    }

    #[test]
    fn flat_bar_is_gap_filled_with_zero_ticks() {
        let bar = OhlcBar::flat(Utc::now(), 250.0);
        assert!(bar.gap_filled);
        assert_eq!(bar.tick_count, 0);
        assert_eq!(bar.open, 250.0);
        assert_eq!(bar.high, 250.0);
        assert_eq!(bar.low, 250.0);
        assert_eq!(bar.close, 250.0);
        assert!(bar.invariant_holds());
    }

    #[test]
    fn write_batch_collects_row_ids() {
        let bar = OhlcBar::first_tick(Utc::now(), 10.0);
        let enriched = EnrichedBar {
            row_id: "FOO_20260101_0915".into(),
            symbol: "FOO".into(),
            segment: "NSE".into(),
            bar,
            tr: 0.0,
            atr: None,
        };
        let batch = WriteBatch {
            window_start: bar.window_start,
            rows: vec![enriched],
            atr_rows: vec![],
        };
        assert_eq!(batch.row_ids(), vec!["FOO_20260101_0915".to_string()]);
        assert_eq!(batch.expected_count(), 1);
    }
}
