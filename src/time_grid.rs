// =============================================================================
// Time Grid — session boundary list and tick-to-window assignment
// =============================================================================
//
// The session is carved into fixed-width windows starting at `open_time`.
// Boundaries are generated by repeated addition, never by modulo arithmetic,
// so that special sessions with a non-standard open behave identically to a
// normal session shifted in time.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeGridError {
    #[error("timestamp {ts} is outside the session [{open}, {close})")]
    OutsideSession {
        ts: DateTime<Utc>,
        open: DateTime<Utc>,
        close: DateTime<Utc>,
    },
}

/// Pre-computed list of window-start boundaries for one trading session.
#[derive(Debug, Clone)]
pub struct TimeGrid {
    open: DateTime<Utc>,
    close: DateTime<Utc>,
    interval: Duration,
    boundaries: Vec<DateTime<Utc>>,
}

impl TimeGrid {
    /// Build the boundary list `[open, open+interval, open+2*interval, ...]`
    /// with every boundary strictly less than `close`.
    pub fn new(open: DateTime<Utc>, close: DateTime<Utc>, interval_minutes: i64) -> Self {
        let interval = Duration::minutes(interval_minutes);
        let mut boundaries = Vec::new();
        let mut current = open;
        while current < close {
            boundaries.push(current);
            current += interval;
        }
        Self {
            open,
            close,
            interval,
            boundaries,
        }
    }

    pub fn boundaries(&self) -> &[DateTime<Utc>] {
        &self.boundaries
    }

    pub fn open(&self) -> DateTime<Utc> {
        self.open
    }

    pub fn close(&self) -> DateTime<Utc> {
        self.close
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Map a tick timestamp to the window it belongs to: the largest
    /// boundary `<= ts`.
    pub fn assign_tick_to_window(&self, ts: DateTime<Utc>) -> Result<DateTime<Utc>, TimeGridError> {
        if ts < self.open || ts >= self.close {
            return Err(TimeGridError::OutsideSession {
                ts,
                open: self.open,
                close: self.close,
            });
        }

        // Boundaries are strictly increasing; partition_point finds the
        // first boundary that is > ts, so the owning window is the one
        // before it.
        let idx = self.boundaries.partition_point(|&b| b <= ts);
        debug_assert!(idx > 0, "ts within session must be covered by a boundary");
        Ok(self.boundaries[idx - 1])
    }

    /// The boundary immediately following `window_start`, or `None` if it
    /// was the last window of the session.
    pub fn next_boundary(&self, window_start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let idx = self.boundaries.iter().position(|&b| b == window_start)?;
        self.boundaries.get(idx + 1).copied()
    }

    /// Boundaries strictly after `now`, in order — used at startup to skip
    /// past already-elapsed windows.
    pub fn remaining_boundaries(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.boundaries.iter().filter(|&&b| b > now).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, h, m, s).unwrap()
    }

    fn session_grid() -> TimeGrid {
        TimeGrid::new(ts(9, 15, 0), ts(15, 30, 0), 5)
    }

    #[test]
    fn boundaries_are_generated_by_addition_not_modulo() {
        let grid = session_grid();
        assert_eq!(grid.boundaries()[0], ts(9, 15, 0));
        assert_eq!(grid.boundaries()[1], ts(9, 20, 0));
        assert_eq!(*grid.boundaries().last().unwrap(), ts(15, 25, 0));
        assert!(grid.boundaries().iter().all(|&b| b < ts(15, 30, 0)));
    }

    #[test]
    fn assign_tick_uses_largest_boundary_leq_ts() {
        let grid = session_grid();
        assert_eq!(grid.assign_tick_to_window(ts(9, 15, 0)).unwrap(), ts(9, 15, 0));
        assert_eq!(grid.assign_tick_to_window(ts(9, 19, 59)).unwrap(), ts(9, 15, 0));
        assert_eq!(grid.assign_tick_to_window(ts(9, 20, 0)).unwrap(), ts(9, 20, 0));
    }

    #[test]
    fn assign_tick_rejects_outside_session() {
        let grid = session_grid();
        assert!(matches!(
            grid.assign_tick_to_window(ts(9, 14, 59)),
            Err(TimeGridError::OutsideSession { .. })
        ));
        assert!(matches!(
            grid.assign_tick_to_window(ts(15, 30, 0)),
            Err(TimeGridError::OutsideSession { .. })
        ));
    }

    #[test]
    fn assignment_is_monotonic() {
        let grid = session_grid();
        let t1 = ts(9, 17, 0);
        let t2 = ts(9, 23, 0);
        assert!(grid.assign_tick_to_window(t1).unwrap() <= grid.assign_tick_to_window(t2).unwrap());
    }

    #[test]
    fn special_session_with_nonstandard_open_behaves_identically() {
        // A special session opening later in the day must produce the same
        // relative boundary structure, proving no modulo-on-wall-clock leaks
        // through.
        let grid = TimeGrid::new(ts(10, 0, 0), ts(13, 30, 0), 5);
        assert_eq!(grid.boundaries()[0], ts(10, 0, 0));
        assert_eq!(grid.boundaries()[1], ts(10, 5, 0));
        assert_eq!(grid.assign_tick_to_window(ts(10, 7, 30)).unwrap(), ts(10, 5, 0));
    }

    #[test]
    fn next_boundary_walks_the_grid() {
        let grid = session_grid();
        assert_eq!(grid.next_boundary(ts(9, 15, 0)), Some(ts(9, 20, 0)));
        assert_eq!(grid.next_boundary(ts(15, 25, 0)), None);
    }

    #[test]
    fn remaining_boundaries_skips_elapsed_ones() {
        let grid = session_grid();
        let remaining = grid.remaining_boundaries(ts(9, 27, 0));
        assert_eq!(remaining[0], ts(9, 30, 0));
    }
}
