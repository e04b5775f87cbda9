// =============================================================================
// Row-ID Generator — deterministic dedup key
// =============================================================================

use chrono::{DateTime, Utc};

/// `row_id(symbol, window_start) = "{symbol}_{YYYYMMDD_HHmm}"`.
///
/// Deterministic, total, injective given unique symbols. This is the sole
/// key used for write-pipeline deduplication.
pub fn row_id(symbol: &str, window_start: DateTime<Utc>) -> String {
    format!("{}_{}", symbol, window_start.format("%Y%m%d_%H%M"))
}

/// Parse a row id back into `(symbol, window_start)`. Returns `None` if the
/// id does not match the expected shape — callers should treat this as a
/// corrupt/foreign record rather than panic.
pub fn parse_row_id(id: &str) -> Option<(String, DateTime<Utc>)> {
    // id is `{symbol}_{YYYYMMDD}_{HHmm}`; split from the right twice.
    let mut parts = id.rsplitn(3, '_');
    let hhmm = parts.next()?;
    let yyyymmdd = parts.next()?;
    let symbol = parts.next()?;
    let stamp = format!("{yyyymmdd}_{hhmm}");

    let parsed = chrono::NaiveDateTime::parse_from_str(&stamp, "%Y%m%d_%H%M").ok()?;
    Some((symbol.to_string(), DateTime::<Utc>::from_naive_utc_and_offset(parsed, Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 20, 0).unwrap()
    }

    #[test]
    fn row_id_has_expected_shape() {
        assert_eq!(row_id("RELIANCE", ts()), "RELIANCE_20260105_0920");
    }

    #[test]
    fn row_id_is_deterministic() {
        assert_eq!(row_id("RELIANCE", ts()), row_id("RELIANCE", ts()));
    }

    #[test]
    fn row_id_is_injective_across_distinct_symbols() {
        assert_ne!(row_id("RELIANCE", ts()), row_id("TCS", ts()));
    }

    #[test]
    fn row_id_is_injective_across_distinct_windows() {
        let other = Utc.with_ymd_and_hms(2026, 1, 5, 9, 25, 0).unwrap();
        assert_ne!(row_id("RELIANCE", ts()), row_id("RELIANCE", other));
    }

    #[test]
    fn parse_row_id_round_trips() {
        let id = row_id("RELIANCE", ts());
        let (symbol, window_start) = parse_row_id(&id).unwrap();
        assert_eq!(symbol, "RELIANCE");
        assert_eq!(window_start, ts());
    }

    #[test]
    fn parse_row_id_rejects_malformed_input() {
        assert!(parse_row_id("not-an-id").is_none());
    }
}
