// =============================================================================
// Instrument Master — static token -> (symbol, segment) mapping
// =============================================================================
//
// Loaded once at boot from a JSON file and never mutated afterward. Token ->
// symbol resolution happens on the feed client's hot path, so the lookup is a
// plain `HashMap` read with no locking. Absent entries cause the tick to be
// dropped and counted rather than crash the feed activity.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct InstrumentRecord {
    token: u64,
    symbol: String,
    segment: String,
}

/// Immutable token -> (symbol, segment) map, plus the derived symbol ->
/// segment index used by the ATR engine and gap-filler.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMaster {
    by_token: HashMap<u64, (String, String)>,
    segment_by_symbol: HashMap<String, String>,
}

impl InstrumentMaster {
    /// Load the static instrument list from `path`. The file is a JSON array
    /// of `{token, symbol, segment}` records.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read instrument master from {}", path.display()))?;
        let records: Vec<InstrumentRecord> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse instrument master from {}", path.display()))?;

        Ok(Self::from_records(records))
    }

    fn from_records(records: Vec<InstrumentRecord>) -> Self {
        let mut by_token = HashMap::with_capacity(records.len());
        let mut segment_by_symbol = HashMap::with_capacity(records.len());
        for rec in records {
            segment_by_symbol.insert(rec.symbol.clone(), rec.segment.clone());
            by_token.insert(rec.token, (rec.symbol, rec.segment));
        }
        Self {
            by_token,
            segment_by_symbol,
        }
    }

    /// Resolve a feed token to `(symbol, segment)`. `None` means the tick
    /// should be dropped and counted — never panic on an unknown token.
    pub fn resolve(&self, token: u64) -> Option<&(String, String)> {
        self.by_token.get(&token)
    }

    pub fn segment_of(&self, symbol: &str) -> String {
        self.segment_by_symbol
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Every symbol in the master, in insertion order — used by the
    /// aggregator's coverage check and the gap-filler's expected set.
    pub fn all_symbols(&self) -> Vec<String> {
        self.segment_by_symbol.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// `{token, segment}` subscription pairs for the feed client, chunked by
    /// the caller into batches of `ws_subscribe_batch_size`.
    pub fn subscription_pairs(&self) -> Vec<(u64, String)> {
        self.by_token
            .iter()
            .map(|(token, (_, segment))| (*token, segment.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstrumentMaster {
        InstrumentMaster::from_records(vec![
            InstrumentRecord {
                token: 1,
                symbol: "RELIANCE".into(),
                segment: "NSE".into(),
            },
            InstrumentRecord {
                token: 2,
                symbol: "TCS".into(),
                segment: "NSE".into(),
            },
        ])
    }

    #[test]
    fn resolve_known_token() {
        let m = sample();
        let (symbol, segment) = m.resolve(1).unwrap();
        assert_eq!(symbol, "RELIANCE");
        assert_eq!(segment, "NSE");
    }

    #[test]
    fn resolve_unknown_token_returns_none() {
        let m = sample();
        assert!(m.resolve(999).is_none());
    }

    #[test]
    fn segment_of_unknown_symbol_is_empty_string() {
        let m = sample();
        assert_eq!(m.segment_of("UNKNOWN"), "");
    }

    #[test]
    fn load_then_resolve_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instruments.json");
        std::fs::write(
            &path,
            r#"[{"token":5,"symbol":"INFY","segment":"NSE"}]"#,
        )
        .unwrap();

        let master = InstrumentMaster::load(&path).unwrap();
        assert_eq!(master.len(), 1);
        assert_eq!(master.resolve(5).unwrap().0, "INFY");
    }
}
