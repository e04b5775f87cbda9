// =============================================================================
// Write Pipeline — producer/consumer queue with dedup, retry, fallback-spool
// =============================================================================
//
// The scheduler activity is the sole producer; the writer activity is the
// sole consumer. The queue is unbounded for a session — expected cardinality
// is bounded by instrument count times bars-per-session, and the writer
// keeps up in steady state so no back-pressure is required.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::store_client::{SystemLogRow, StoreClient};
use crate::types::{EnrichedBar, WriteBatch};

const MARKET_DATA_TABLE: &str = "market_data";
const ATR_STATE_TABLE: &str = "atr_state";
const SYSTEM_LOG_TABLE: &str = "system_log";

pub fn channel() -> (mpsc::UnboundedSender<WriteBatch>, mpsc::UnboundedReceiver<WriteBatch>) {
    mpsc::unbounded_channel()
}

fn row_to_json(row: &EnrichedBar) -> serde_json::Value {
    json!({
        "id": row.row_id,
        "timestamp": row.bar.window_start.to_rfc3339(),
        "ticker": row.symbol,
        "segment": row.segment,
        "open": row.bar.open,
        "high": row.bar.high,
        "low": row.bar.low,
        "close": row.bar.close,
        "tr": row.tr,
        "atr": row.atr,
        "volume": serde_json::Value::Null,
        "gap_filled": row.bar.gap_filled,
        "created_at": chrono::Utc::now().to_rfc3339(),
    })
}

/// Consumer side of the write pipeline. Owns the fallback-spool file
/// exclusively.
pub struct Writer {
    store: StoreClient,
    spool_path: PathBuf,
    max_retries: u32,
    base_delay: std::time::Duration,
}

impl Writer {
    pub fn new(store: StoreClient, spool_path: impl Into<PathBuf>, max_retries: u32, base_delay_s: u64) -> Self {
        Self {
            store,
            spool_path: spool_path.into(),
            max_retries,
            base_delay: std::time::Duration::from_secs(base_delay_s),
        }
    }

    /// Top-level consumer loop. Exits when the channel closes (sentinel
    /// shutdown) or a stop flag is observed by the caller between batches.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<WriteBatch>) {
        loop {
            self.drain_spool().await;

            match rx.recv().await {
                Some(batch) => {
                    if let Err(e) = self.process_batch(&batch).await {
                        error!(error = %e, "unexpected error processing write batch, batch was spooled");
                    }
                }
                None => {
                    info!("write queue closed, writer shutting down");
                    break;
                }
            }
        }
    }

    /// Process one batch: dedup against the store, append with backoff
    /// retry, sync the ATR-state "latest view", and spool on exhaustion.
    pub async fn process_batch(&self, batch: &WriteBatch) -> anyhow::Result<()> {
        let existing_ids = self.fetch_existing_ids(batch).await.unwrap_or_default();

        let to_write: Vec<&EnrichedBar> = batch
            .rows
            .iter()
            .filter(|r| !existing_ids.contains(&r.row_id))
            .collect();

        if to_write.is_empty() {
            info!(window = %batch.window_start, "all rows already present, dedup-skip");
            if let Err(e) = self.sync_atr_table(&batch.atr_rows).await {
                warn!(error = %e, "ATR-state table sync failed after dedup-skip (non-fatal)");
            }
            return Ok(());
        }

        let rows_json: Vec<serde_json::Value> = to_write.iter().map(|r| row_to_json(r)).collect();
        let expected = rows_json.len();

        match self.append_with_retry(&rows_json, expected).await {
            Ok(()) => {
                self.log_audit_event(batch).await;
                if let Err(e) = self.sync_atr_table(&batch.atr_rows).await {
                    warn!(error = %e, "ATR-state table sync failed after append (non-fatal)");
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, window = %batch.window_start, "write exhausted retries, spooling to fallback");
                self.spool(batch)?;
                Err(e)
            }
        }
    }

    async fn fetch_existing_ids(&self, batch: &WriteBatch) -> anyhow::Result<HashSet<String>> {
        let rows = self.store.get_all_values(MARKET_DATA_TABLE).await?;
        let window_str = batch.window_start.to_rfc3339();
        Ok(rows
            .into_iter()
            .filter(|row| row.get("timestamp").and_then(|v| v.as_str()) == Some(window_str.as_str()))
            .filter_map(|row| row.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect())
    }

    async fn append_with_retry(&self, rows: &[serde_json::Value], expected: usize) -> anyhow::Result<()> {
        for attempt in 1..=self.max_retries {
            match self.store.append_rows(MARKET_DATA_TABLE, rows).await {
                Ok(result) if result.updated_rows == expected => return Ok(()),
                Ok(result) => {
                    warn!(attempt, expected, updated = result.updated_rows, "partial write detected");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "store append failed");
                }
            }
            if attempt < self.max_retries {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
        anyhow::bail!("append_rows exhausted {} retries", self.max_retries)
    }

    async fn log_audit_event(&self, batch: &WriteBatch) {
        let row = SystemLogRow {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: "INFO".to_string(),
            event: "MARKET_DATA_APPENDED".to_string(),
            window: Some(batch.window_start.to_rfc3339()),
            details: format!("rows={}", batch.rows.len()),
        };
        if let Ok(value) = serde_json::to_value(&row) {
            if let Err(e) = self.store.append_rows(SYSTEM_LOG_TABLE, &[value]).await {
                warn!(error = %e, "failed to write audit log row (non-fatal)");
            }
        }
    }

    /// Overwrite the `atr_state` table with the full snapshot carried on
    /// the batch. Called from `process_batch` right after the market-data
    /// append is confirmed (or found already present via dedup). Idempotent
    /// — a cheap "latest view" for reconciliation and external readers.
    pub async fn sync_atr_table(&self, rows: &[serde_json::Value]) -> anyhow::Result<()> {
        self.store.resize(ATR_STATE_TABLE, rows).await
    }

    fn spool(&self, batch: &WriteBatch) -> anyhow::Result<()> {
        let mut pending = self.load_spool_unchecked();
        pending.push(batch.clone());
        self.write_spool(&pending)
    }

    fn load_spool_unchecked(&self) -> Vec<WriteBatch> {
        match std::fs::read_to_string(&self.spool_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn write_spool(&self, batches: &[WriteBatch]) -> anyhow::Result<()> {
        if batches.is_empty() {
            let _ = std::fs::remove_file(&self.spool_path);
            return Ok(());
        }
        let content = serde_json::to_string_pretty(batches)?;
        std::fs::write(&self.spool_path, content)?;
        Ok(())
    }

    /// Drain the fallback spool before processing the next fresh batch.
    /// Each spooled batch replays through the same `process_batch` path —
    /// dedup by id makes replay safe — and the file is rewritten with
    /// whatever still fails.
    pub async fn drain_spool(&self) {
        if !Path::new(&self.spool_path).exists() {
            return;
        }
        let pending = self.load_spool_unchecked();
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "draining fallback spool");
        let mut still_failing = Vec::new();
        for batch in pending {
            if self.process_batch(&batch).await.is_err() {
                still_failing.push(batch);
            }
        }
        let _ = self.write_spool(&still_failing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OhlcBar;
    use chrono::{TimeZone, Utc};

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 20, 0).unwrap()
    }

    fn sample_batch() -> WriteBatch {
        let bar = OhlcBar::first_tick(ts(), 100.0);
        WriteBatch {
            window_start: ts(),
            rows: vec![EnrichedBar {
                row_id: "FOO_20260105_0920".into(),
                symbol: "FOO".into(),
                segment: "NSE".into(),
                bar,
                tr: 0.0,
                atr: None,
            }],
            atr_rows: vec![json!({"ticker": "FOO", "last_close": 100.0})],
        }
    }

    #[test]
    fn row_to_json_carries_all_thirteen_columns() {
        let batch = sample_batch();
        let v = row_to_json(&batch.rows[0]);
        for key in [
            "id", "timestamp", "ticker", "segment", "open", "high", "low", "close", "tr", "atr",
            "volume", "gap_filled", "created_at",
        ] {
            assert!(v.get(key).is_some(), "missing column {key}");
        }
    }

    #[test]
    fn spool_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let spool_path = dir.path().join("unsent_backup.json");
        let store = StoreClient::new("https://store.example", "k", "s");
        let writer = Writer::new(store, &spool_path, 5, 1);

        let batch = sample_batch();
        writer.spool(&batch).unwrap();

        let loaded = writer.load_spool_unchecked();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].window_start, ts());
    }

    #[test]
    fn write_spool_removes_file_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let spool_path = dir.path().join("unsent_backup.json");
        std::fs::write(&spool_path, "[]").unwrap();
        let store = StoreClient::new("https://store.example", "k", "s");
        let writer = Writer::new(store, &spool_path, 5, 1);

        writer.write_spool(&[]).unwrap();
        assert!(!spool_path.exists());
    }
}
