// =============================================================================
// Tick Buffer — thread-safe per-window OHLC accumulator with freeze/snapshot
// =============================================================================
//
// A single mutex guards the active window, the frozen flag, the accumulator
// map, and the late/future drop counters. The feed activity calls `update`
// on the hot path; the scheduler activity calls `freeze` and
// `snapshot_and_reset` once per boundary. Holding the lock is O(1) per call.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::types::OhlcBar;

struct Inner {
    active_window: Option<DateTime<Utc>>,
    frozen: bool,
    bars: HashMap<String, OhlcBar>,
    late_ticks: u64,
    future_ticks: u64,
}

/// Per-session, cross-instrument tick accumulator.
///
/// Shared between the feed activity (many `update` calls) and the scheduler
/// activity (one `freeze` and one `snapshot_and_reset` per boundary).
pub struct TickBuffer {
    inner: Mutex<Inner>,
}

/// Drop counters returned by a snapshot, for per-window summary logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropCounts {
    pub late_ticks: u64,
    pub future_ticks: u64,
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active_window: None,
                frozen: false,
                bars: HashMap::new(),
                late_ticks: 0,
                future_ticks: 0,
            }),
        }
    }

    /// Set the active window. Used at session start and after each
    /// `FROZEN -> COLLECTING` transition. Does not touch the frozen flag —
    /// callers must clear it themselves via a fresh buffer state if needed.
    pub fn set_active_window(&self, window_start: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.active_window = Some(window_start);
        inner.frozen = false;
    }

    /// Transition into the frozen state: further `update` calls are
    /// rejected until the next `set_active_window`.
    pub fn freeze(&self) {
        self.inner.lock().frozen = true;
    }

    /// Apply a tick for `symbol` at `window_start`. Returns `true` if
    /// accepted into the active window's accumulator.
    pub fn update(&self, symbol: &str, price: f64, window_start: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();

        if inner.frozen {
            inner.late_ticks += 1;
            return false;
        }

        let active = match inner.active_window {
            Some(w) => w,
            None => {
                // No window has been set yet; treat as a future tick so it
                // is counted rather than silently dropped.
                inner.future_ticks += 1;
                return false;
            }
        };

        if window_start < active {
            inner.late_ticks += 1;
            return false;
        }
        if window_start > active {
            inner.future_ticks += 1;
            return false;
        }

        match inner.bars.get_mut(symbol) {
            Some(bar) => bar.apply_tick(price),
            None => {
                inner.bars.insert(symbol.to_string(), OhlcBar::first_tick(active, price));
            }
        }
        true
    }

    /// Deep-copy the accumulator map and atomically clear it along with the
    /// drop counters. The frozen flag and active window are left untouched;
    /// the aggregator transitions them explicitly afterward.
    pub fn snapshot_and_reset(&self) -> (HashMap<String, OhlcBar>, DropCounts) {
        let mut inner = self.inner.lock();
        let bars = std::mem::take(&mut inner.bars);
        let counts = DropCounts {
            late_ticks: inner.late_ticks,
            future_ticks: inner.future_ticks,
        };
        inner.late_ticks = 0;
        inner.future_ticks = 0;
        (bars, counts)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    pub fn active_window(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().active_window
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
