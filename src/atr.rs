// =============================================================================
// ATR Engine — per-instrument incremental Wilder Average True Range
// =============================================================================
//
// TR = max(high-low, |high-prev_close|, |low-prev_close|) once a previous
// close exists, else TR = high-low. The first `atr_period` True Ranges are
// averaged to seed `prev_atr` (warmup); afterward Wilder's smoothing applies:
// prev_atr <- ((prev_atr * (period-1)) + TR) / period.
//
// State lives entirely in `AtrState`, one per instrument, so the engine can
// be exported, persisted, and reloaded without recomputing history.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, warn};

use crate::types::{EnrichedBar, OhlcBar};

/// Per-instrument ATR bookkeeping. `prev_atr` is `None` iff `candle_count <
/// atr_period`. `tr_history` holds the accumulated warmup TRs and is empty
/// once `prev_atr` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrState {
    pub prev_close: Option<f64>,
    pub prev_atr: Option<f64>,
    pub tr_history: Vec<f64>,
    pub candle_count: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl Default for AtrState {
    fn default() -> Self {
        Self {
            prev_close: None,
            prev_atr: None,
            tr_history: Vec::new(),
            candle_count: 0,
            last_timestamp: None,
        }
    }
}

/// Summary row for the `atr_state` store table / reconciliation checks.
#[derive(Debug, Clone, Copy)]
pub struct AtrSummary {
    pub last_close: Option<f64>,
    pub last_atr: Option<f64>,
    pub candle_count: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

pub struct AtrEngine {
    period: usize,
    precision: u32,
    state: HashMap<String, AtrState>,
}

impl AtrEngine {
    pub fn new(period: usize, precision: u32) -> Self {
        Self {
            period,
            precision,
            state: HashMap::new(),
        }
    }

    fn round(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.precision as i32);
        (value * factor).round() / factor
    }

    /// Compute TR and ATR for a single bar and update the instrument's
    /// state. Returns `(tr, atr)` — `atr` is `None` during warmup.
    pub fn process(&mut self, symbol: &str, bar: &OhlcBar) -> (f64, Option<f64>) {
        let entry = self.state.entry(symbol.to_string()).or_default();

        let tr = match entry.prev_close {
            Some(prev_close) => {
                let a = bar.high - bar.low;
                let b = (bar.high - prev_close).abs();
                let c = (bar.low - prev_close).abs();
                a.max(b).max(c)
            }
            None => bar.high - bar.low,
        };
        let tr = self.round(tr);

        let atr = if let Some(prev_atr) = entry.prev_atr {
            let period = self.period as f64;
            let mut next = ((prev_atr * (period - 1.0)) + tr) / period;

            if next < 0.0 {
                error!(symbol, atr = next, "negative ATR computed — clamping to zero");
                next = 0.0;
            }
            if prev_atr > 0.0 && next > prev_atr * 3.0 {
                warn!(symbol, prev_atr, new_atr = next, "ATR jumped more than 3x prior value");
            }

            let next = self.round(next);
            entry.prev_atr = Some(next);
            Some(next)
        } else {
            entry.tr_history.push(tr);
            if entry.tr_history.len() == self.period {
                let mean = entry.tr_history.iter().sum::<f64>() / self.period as f64;
                let mean = self.round(mean);
                entry.prev_atr = Some(mean);
                entry.tr_history.clear();
                Some(mean)
            } else {
                None
            }
        };

        entry.prev_close = Some(bar.close);
        entry.candle_count += 1;
        entry.last_timestamp = Some(bar.window_start);

        (tr, atr)
    }

    /// Enrich an entire finalized (and gap-filled) snapshot in one pass.
    /// `segments` resolves each symbol's segment for the row; `row_ids`
    /// resolves each symbol's deterministic row id.
    pub fn process_batch(
        &mut self,
        bars: &HashMap<String, OhlcBar>,
        segment_of: impl Fn(&str) -> String,
        row_id_of: impl Fn(&str, DateTime<Utc>) -> String,
    ) -> Vec<EnrichedBar> {
        let mut out: Vec<EnrichedBar> = bars
            .iter()
            .map(|(symbol, bar)| {
                let (tr, atr) = self.process(symbol, bar);
                EnrichedBar {
                    row_id: row_id_of(symbol, bar.window_start),
                    symbol: symbol.clone(),
                    segment: segment_of(symbol),
                    bar: *bar,
                    tr,
                    atr,
                }
            })
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    pub fn get_atr_summary(&self, symbol: &str) -> Option<AtrSummary> {
        self.state.get(symbol).map(|s| AtrSummary {
            last_close: s.prev_close,
            last_atr: s.prev_atr,
            candle_count: s.candle_count,
            last_timestamp: s.last_timestamp,
        })
    }

    pub fn export_state(&self) -> HashMap<String, AtrState> {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: HashMap<String, AtrState>) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, m, 0).unwrap()
    }

    fn bar(window_m: u32, high: f64, low: f64, close: f64) -> OhlcBar {
        OhlcBar {
            window_start: ts(window_m),
            open: close,
            high,
            low,
            close,
            tick_count: 1,
            gap_filled: false,
        }
    }

    #[test]
    fn first_bar_has_no_prev_close_tr_is_high_minus_low() {
        let mut engine = AtrEngine::new(14, 4);
        let (tr, atr) = engine.process("FOO", &bar(0, 105.0, 95.0, 100.0));
        assert_eq!(tr, 10.0);
        assert!(atr.is_none());
    }

    #[test]
    fn atr_is_null_until_the_fourteenth_bar() {
        let mut engine = AtrEngine::new(14, 4);
        let mut last_atr = None;
        for i in 0..13 {
            let (_, atr) = engine.process("FOO", &bar(i, 101.0, 100.0, 100.5));
            last_atr = atr;
        }
        assert!(last_atr.is_none());
    }

    #[test]
    fn warmup_boundary_scenario_from_spec() {
        // TRs [1,1,1,1,1,1,1,1,1,1,1,1,1,3] -> bar 14 ATR = mean = 16/14.
        let mut engine = AtrEngine::new(14, 4);
        let mut close = 100.0;
        for i in 0..13 {
            let b = bar(i, close + 1.0, close, close + 1.0);
            let (tr, atr) = engine.process("FOO", &b);
            assert_eq!(tr, 1.0);
            assert!(atr.is_none());
            close = b.close;
        }
        // 14th bar: force TR = 3 via a wide high/low around prev_close.
        let b14 = OhlcBar {
            window_start: ts(13),
            open: close,
            high: close + 2.0,
            low: close - 1.0,
            close,
            tick_count: 1,
            gap_filled: false,
        };
        let (tr, atr) = engine.process("FOO", &b14);
        assert_eq!(tr, 3.0);
        let expected = (13.0 * 1.0 + 3.0) / 14.0;
        assert!((atr.unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn steady_state_uses_wilder_smoothing_within_tolerance() {
        let mut engine = AtrEngine::new(14, 4);
        for i in 0..14 {
            engine.process("FOO", &bar(i, 101.0, 100.0, 100.5));
        }
        let summary_before = engine.get_atr_summary("FOO").unwrap();
        let prev_atr = summary_before.last_atr.unwrap();

        let (tr, atr) = engine.process("FOO", &bar(14, 110.0, 90.0, 100.0));
        let expected = ((prev_atr * 13.0) + tr) / 14.0;
        assert!((atr.unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn negative_atr_is_clamped_to_zero() {
        // Force a pathological prev_atr that would smooth negative given a
        // TR of zero; engineered directly through process() is awkward, so
        // validate the clamp logic with a synthetic state instead.
        let mut engine = AtrEngine::new(14, 4);
        let mut state = HashMap::new();
        state.insert(
            "FOO".to_string(),
            AtrState {
                prev_close: Some(100.0),
                prev_atr: Some(-5.0),
                tr_history: vec![],
                candle_count: 20,
                last_timestamp: Some(ts(0)),
            },
        );
        engine.load_state(state);
        let (_, atr) = engine.process("FOO", &bar(1, 100.0, 100.0, 100.0));
        assert_eq!(atr, Some(0.0));
    }

    #[test]
    fn last_timestamp_advances_unconditionally_even_on_gap_filled_bars() {
        let mut engine = AtrEngine::new(14, 4);
        engine.process("FOO", &bar(0, 101.0, 100.0, 100.0));
        let gap_bar = OhlcBar::flat(ts(1), 100.0);
        engine.process("FOO", &gap_bar);
        let summary = engine.get_atr_summary("FOO").unwrap();
        assert_eq!(summary.last_timestamp, Some(ts(1)));
    }

    #[test]
    fn export_then_load_round_trips_exactly_mid_warmup() {
        let mut engine = AtrEngine::new(14, 4);
        for i in 0..5 {
            engine.process("FOO", &bar(i, 101.0, 100.0, 100.5));
        }
        let exported = engine.export_state();
        assert_eq!(exported["FOO"].tr_history.len(), 5);

        let mut restored = AtrEngine::new(14, 4);
        restored.load_state(exported.clone());
        assert_eq!(restored.export_state()["FOO"].tr_history, exported["FOO"].tr_history);
        assert_eq!(restored.export_state()["FOO"].candle_count, 5);
    }

    #[test]
    fn gap_fill_scenario_tr_is_zero_when_flat_at_prev_close() {
        let mut engine = AtrEngine::new(14, 4);
        engine.process("X", &bar(0, 251.0, 249.0, 250.0));
        let gap_bar = OhlcBar::flat(ts(1), 250.0);
        let (tr, _) = engine.process("X", &gap_bar);
        assert_eq!(tr, 0.0);
    }
}
