// =============================================================================
// Aggregator — window lifecycle state machine
// =============================================================================
//
// Owns the lifecycle state and the pre-computed boundary list exclusively.
// Drives the tick buffer through `freeze` / `snapshot_and_reset` /
// `set_active_window` at the right moments and validates the finalized
// snapshot. Validation never fails the cycle — it only warns.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::tick_buffer::{DropCounts, TickBuffer};
use crate::time_grid::TimeGrid;
use crate::types::{OhlcBar, WindowState};

/// Window lifecycle state machine. Single-threaded — owned by the
/// scheduler activity alone.
pub struct Aggregator {
    state: WindowState,
    grid: TimeGrid,
    active_window: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(grid: TimeGrid) -> Self {
        Self {
            state: WindowState::Idle,
            grid,
            active_window: None,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn active_window(&self) -> Option<DateTime<Utc>> {
        self.active_window
    }

    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    /// `IDLE -> COLLECTING`: set the active window on the buffer and start
    /// the session.
    pub fn start_session(&mut self, buffer: &TickBuffer, first_window: DateTime<Utc>) {
        buffer.set_active_window(first_window);
        self.active_window = Some(first_window);
        self.state = WindowState::Collecting;
    }

    /// `COLLECTING -> FREEZING`: boundary reached, stop admitting ticks for
    /// the current window.
    pub fn freeze(&mut self, buffer: &TickBuffer) {
        buffer.freeze();
        self.state = WindowState::Freezing;
    }

    /// `FREEZING -> FROZEN`: freeze-grace has elapsed. Snapshot the buffer,
    /// validate it against the expected symbol set, and return the bars
    /// along with the drop counters observed this window.
    pub fn finalize(
        &mut self,
        buffer: &TickBuffer,
        expected_symbols: &[String],
    ) -> (HashMap<String, OhlcBar>, DropCounts) {
        let (bars, counts) = buffer.snapshot_and_reset();
        self.validate(&bars, expected_symbols);
        self.state = WindowState::Frozen;
        (bars, counts)
    }

    /// `FROZEN -> COLLECTING`: advance the buffer to the next boundary.
    pub fn transition_to_next_window(&mut self, buffer: &TickBuffer, next_window: DateTime<Utc>) {
        buffer.set_active_window(next_window);
        self.active_window = Some(next_window);
        self.state = WindowState::Collecting;
    }

    /// Any state -> IDLE at session end.
    pub fn end_session(&mut self) {
        self.active_window = None;
        self.state = WindowState::Idle;
    }

    /// Missing-symbol coverage and OHLC-invariant checks. Never fatal —
    /// every violation is a warning, and the bar passes through unchanged.
    fn validate(&self, bars: &HashMap<String, OhlcBar>, expected_symbols: &[String]) {
        let missing: Vec<&str> = expected_symbols
            .iter()
            .filter(|s| !bars.contains_key(s.as_str()))
            .map(|s| s.as_str())
            .collect();
        if !missing.is_empty() {
            warn!(count = missing.len(), symbols = ?missing, "instruments silent in window");
        }

        for (symbol, bar) in bars {
            if !bar.invariant_holds() {
                warn!(
                    symbol,
                    open = bar.open,
                    high = bar.high,
                    low = bar.low,
                    close = bar.close,
                    "OHLC invariant violated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, m, 0).unwrap()
    }

    fn grid() -> TimeGrid {
        TimeGrid::new(ts(15), Utc.with_ymd_and_hms(2026, 1, 5, 15, 30, 0).unwrap(), 5)
    }

    #[test]
    fn full_lifecycle_cycles_through_all_states() {
        let buffer = TickBuffer::new();
        let mut agg = Aggregator::new(grid());

        agg.start_session(&buffer, ts(15));
        assert_eq!(agg.state(), WindowState::Collecting);

        buffer.update("FOO", 100.0, ts(15));
        agg.freeze(&buffer);
        assert_eq!(agg.state(), WindowState::Freezing);
        assert!(buffer.is_frozen());

        let (bars, _) = agg.finalize(&buffer, &["FOO".to_string()]);
        assert_eq!(agg.state(), WindowState::Frozen);
        assert_eq!(bars.len(), 1);

        agg.transition_to_next_window(&buffer, ts(20));
        assert_eq!(agg.state(), WindowState::Collecting);
        assert_eq!(agg.active_window(), Some(ts(20)));
        assert!(!buffer.is_frozen());

        agg.end_session();
        assert_eq!(agg.state(), WindowState::Idle);
    }

    #[test]
    fn finalize_never_panics_on_missing_symbol() {
        let buffer = TickBuffer::new();
        let mut agg = Aggregator::new(grid());
        agg.start_session(&buffer, ts(15));
        agg.freeze(&buffer);
        let (bars, _) = agg.finalize(&buffer, &["FOO".to_string(), "BAR".to_string()]);
        assert!(bars.is_empty());
    }

    #[test]
    fn finalize_never_panics_on_invariant_violation() {
        let buffer = TickBuffer::new();
        let mut agg = Aggregator::new(grid());
        agg.start_session(&buffer, ts(15));
        buffer.update("FOO", 100.0, ts(15));
        agg.freeze(&buffer);
        let (bars, _) = agg.finalize(&buffer, &[]);
        assert!(bars["FOO"].invariant_holds());
    }
}
