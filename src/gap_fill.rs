// =============================================================================
// Gap-Filler — synthesize flat bars for instruments silent in a window
// =============================================================================
//
// Stateful across the session: tracks the last known close per symbol.
// Called between snapshot and the ATR engine at every finalize so that an
// instrument silent for a window still gets a row, keeping ATR's TR
// computation well-defined even across silence.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::OhlcBar;

#[derive(Default)]
pub struct GapFiller {
    last_close: HashMap<String, f64>,
}

impl GapFiller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject flat bars for every expected symbol absent from `bars`, then
    /// refresh `last_close` from the merged snapshot. Symbols that have
    /// never traded (cold-start) are reported as unfillable rather than
    /// synthesized.
    pub fn fill(
        &mut self,
        mut bars: HashMap<String, OhlcBar>,
        expected_symbols: &[String],
        window_start: DateTime<Utc>,
    ) -> (HashMap<String, OhlcBar>, Vec<String>) {
        let mut unfillable = Vec::new();

        for symbol in expected_symbols {
            if bars.contains_key(symbol) {
                continue;
            }
            match self.last_close.get(symbol) {
                Some(&close) => {
                    bars.insert(symbol.clone(), OhlcBar::flat(window_start, close));
                }
                None => {
                    warn!(symbol, "cold-start symbol has no prior close — unfillable");
                    unfillable.push(symbol.clone());
                }
            }
        }

        for (symbol, bar) in &bars {
            self.last_close.insert(symbol.clone(), bar.close);
        }

        (bars, unfillable)
    }

    pub fn last_close_of(&self, symbol: &str) -> Option<f64> {
        self.last_close.get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, m, 0).unwrap()
    }

    #[test]
    fn cold_start_symbol_is_unfillable() {
        let mut gf = GapFiller::new();
        let bars = HashMap::new();
        let (filled, unfillable) = gf.fill(bars, &["X".to_string()], ts(15));
        assert!(filled.is_empty());
        assert_eq!(unfillable, vec!["X".to_string()]);
    }

    #[test]
    fn silent_window_after_trade_gets_flat_bar() {
        let mut gf = GapFiller::new();
        // Window 1: X trades, closes at 250.
        let mut bars = HashMap::new();
        bars.insert("X".to_string(), OhlcBar::first_tick(ts(15), 250.0));
        let (filled, unfillable) = gf.fill(bars, &["X".to_string()], ts(15));
        assert!(unfillable.is_empty());
        assert_eq!(filled["X"].close, 250.0);

        // Window 2: X silent.
        let (filled2, unfillable2) = gf.fill(HashMap::new(), &["X".to_string()], ts(20));
        assert!(unfillable2.is_empty());
        let bar = filled2["X"];
        assert!(bar.gap_filled);
        assert_eq!(bar.tick_count, 0);
        assert_eq!(bar.open, 250.0);
        assert_eq!(bar.high, 250.0);
        assert_eq!(bar.low, 250.0);
        assert_eq!(bar.close, 250.0);
    }

    #[test]
    fn trade_resumes_after_gap_fill_without_carrying_gap_flag() {
        let mut gf = GapFiller::new();
        let mut bars = HashMap::new();
        bars.insert("X".to_string(), OhlcBar::first_tick(ts(15), 250.0));
        gf.fill(bars, &["X".to_string()], ts(15));
        gf.fill(HashMap::new(), &["X".to_string()], ts(20));

        let mut resumed = HashMap::new();
        let mut bar = OhlcBar::first_tick(ts(25), 251.0);
        bar.apply_tick(252.0);
        resumed.insert("X".to_string(), bar);
        let (filled, unfillable) = gf.fill(resumed, &["X".to_string()], ts(25));
        assert!(unfillable.is_empty());
        assert!(!filled["X"].gap_filled);
        assert_eq!(filled["X"].open, 251.0);
        assert_eq!(filled["X"].close, 252.0);
        assert_eq!(gf.last_close_of("X"), Some(252.0));
    }

    #[test]
    fn last_close_updates_from_gap_filled_bars_too() {
        let mut gf = GapFiller::new();
        let mut bars = HashMap::new();
        bars.insert("X".to_string(), OhlcBar::first_tick(ts(15), 100.0));
        gf.fill(bars, &["X".to_string()], ts(15));
        gf.fill(HashMap::new(), &["X".to_string()], ts(20));
        assert_eq!(gf.last_close_of("X"), Some(100.0));
    }
}
