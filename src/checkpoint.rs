// =============================================================================
// Checkpoint Manager — atomic local snapshot and startup reconciliation
// =============================================================================
//
// Atomic save: write to a temp file in the checkpoint directory, fsync, then
// rename over the canonical `checkpoint.json`. Before writing, rotated
// backups are shifted one slot down so the previous canonical file survives
// as `checkpoint_1.json`. Load falls through the rotated copies in order if
// the canonical file is missing or corrupt.
// =============================================================================

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::atr::AtrState;
use crate::types::ReconciliationSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub last_window: DateTime<Utc>,
    pub atr_state: HashMap<String, AtrState>,
    pub saved_at: DateTime<Utc>,
    pub sheets_write_confirmed: bool,
}

pub struct CheckpointManager {
    dir: PathBuf,
    max_files: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files,
        }
    }

    fn canonical_path(&self) -> PathBuf {
        self.dir.join("checkpoint.json")
    }

    fn rotated_path(&self, k: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_{k}.json"))
    }

    /// Atomic save with rotation: `checkpoint_{k-1} -> checkpoint_{k}` for
    /// `k = max_files..1`, then the current canonical becomes
    /// `checkpoint_1`, then the new record is written as the canonical.
    pub fn save(&self, record: &CheckpointRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        for k in (1..self.max_files).rev() {
            let from = self.rotated_path(k);
            let to = self.rotated_path(k + 1);
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        let canonical = self.canonical_path();
        if canonical.exists() {
            let _ = fs::copy(&canonical, self.rotated_path(1));
        }

        let tmp_path = self.dir.join("checkpoint.json.tmp");
        let content = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, &content)?;

        // fsync the temp file before the rename so the rename is the only
        // non-durable step left in the window.
        let file = File::open(&tmp_path)?;
        file.sync_all()?;

        fs::rename(&tmp_path, &canonical)?;
        Ok(())
    }

    /// Try the canonical file; on parse failure or a missing file, fall
    /// through the rotated backups in order. Returns `None` if nothing
    /// parses.
    pub fn load(&self) -> Option<CheckpointRecord> {
        if let Some(record) = self.try_load_path(&self.canonical_path()) {
            return Some(record);
        }
        warn!("canonical checkpoint missing or corrupt, falling through rotated backups");
        for k in 1..=self.max_files {
            if let Some(record) = self.try_load_path(&self.rotated_path(k)) {
                warn!(backup = k, "loaded checkpoint from rotated backup");
                return Some(record);
            }
        }
        None
    }

    fn try_load_path(&self, path: &Path) -> Option<CheckpointRecord> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(path = %path.display(), error = %e, "checkpoint file failed to parse");
                None
            }
        }
    }
}

/// Outcome of startup reconciliation: the ATR state to adopt plus a label
/// describing where it came from.
pub struct Reconciliation {
    pub atr_state: HashMap<String, AtrState>,
    pub source: ReconciliationSource,
    pub last_window: Option<DateTime<Utc>>,
}

/// Compare the local checkpoint's `last_window` against the store's
/// `store_max_timestamp` in the bar table and decide which ATR state to
/// adopt, per the six-case decision table.
pub fn reconcile(
    local: Option<&CheckpointRecord>,
    store_max_timestamp: Option<DateTime<Utc>>,
    store_atr_state: HashMap<String, AtrState>,
    atr_divergence_epsilon: f64,
) -> Reconciliation {
    match (local, store_max_timestamp) {
        (None, None) => Reconciliation {
            atr_state: HashMap::new(),
            source: ReconciliationSource::Fresh,
            last_window: None,
        },
        (None, Some(_)) => Reconciliation {
            atr_state: store_atr_state,
            source: ReconciliationSource::Sheets,
            last_window: store_max_timestamp,
        },
        (Some(local), None) => Reconciliation {
            atr_state: local.atr_state.clone(),
            source: ReconciliationSource::Local,
            last_window: Some(local.last_window),
        },
        (Some(local), Some(store_ts)) => {
            if local.last_window == store_ts {
                let divergences = count_divergences(&local.atr_state, &store_atr_state, atr_divergence_epsilon);
                if divergences > 0 {
                    warn!(divergences, "ATR state divergence between local checkpoint and store at matching window");
                }
                Reconciliation {
                    atr_state: local.atr_state.clone(),
                    source: ReconciliationSource::Consistent,
                    last_window: Some(local.last_window),
                }
            } else if local.last_window > store_ts {
                // Checkpoint saved before the store write completed —
                // expected in steady-state operation.
                Reconciliation {
                    atr_state: local.atr_state.clone(),
                    source: ReconciliationSource::Local,
                    last_window: Some(local.last_window),
                }
            } else {
                // A fallback drain happened after the last checkpoint.
                Reconciliation {
                    atr_state: store_atr_state,
                    source: ReconciliationSource::Sheets,
                    last_window: Some(store_ts),
                }
            }
        }
    }
}

fn count_divergences(
    local: &HashMap<String, AtrState>,
    store: &HashMap<String, AtrState>,
    epsilon: f64,
) -> usize {
    local
        .iter()
        .filter(|(symbol, state)| {
            let local_atr = state.prev_atr.unwrap_or(0.0);
            let store_atr = store.get(symbol.as_str()).and_then(|s| s.prev_atr).unwrap_or(local_atr);
            (local_atr - store_atr).abs() > epsilon
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, m, 0).unwrap()
    }

    fn sample_record(last_window: DateTime<Utc>) -> CheckpointRecord {
        let mut atr_state = HashMap::new();
        atr_state.insert(
            "FOO".to_string(),
            AtrState {
                prev_close: Some(100.0),
                prev_atr: Some(1.5),
                tr_history: vec![],
                candle_count: 20,
                last_timestamp: Some(last_window),
            },
        );
        CheckpointRecord {
            last_window,
            atr_state,
            saved_at: Utc::now(),
            sheets_write_confirmed: false,
        }
    }

    #[test]
    fn save_then_load_round_trips_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), 3);
        let record = sample_record(ts(20));
        mgr.save(&record).unwrap();

        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.last_window, record.last_window);
        assert_eq!(loaded.atr_state["FOO"].prev_atr, record.atr_state["FOO"].prev_atr);
    }

    #[test]
    fn rotation_preserves_previous_canonical_as_backup_one() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), 3);
        mgr.save(&sample_record(ts(15))).unwrap();
        mgr.save(&sample_record(ts(20))).unwrap();

        let backup = mgr.try_load_path(&mgr.rotated_path(1)).unwrap();
        assert_eq!(backup.last_window, ts(15));
        let canonical = mgr.load().unwrap();
        assert_eq!(canonical.last_window, ts(20));
    }

    #[test]
    fn load_falls_through_to_backup_when_canonical_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), 3);
        mgr.save(&sample_record(ts(15))).unwrap();
        mgr.save(&sample_record(ts(20))).unwrap();

        fs::write(mgr.canonical_path(), "{ not json").unwrap();
        let loaded = mgr.load().unwrap();
        assert_eq!(loaded.last_window, ts(15));
    }

    #[test]
    fn load_returns_none_when_nothing_parses() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), 3);
        assert!(mgr.load().is_none());
    }

    #[test]
    fn reconcile_fresh_when_both_absent() {
        let r = reconcile(None, None, HashMap::new(), 0.0001);
        assert_eq!(r.source, ReconciliationSource::Fresh);
        assert!(r.atr_state.is_empty());
    }

    #[test]
    fn reconcile_adopts_store_when_only_store_present() {
        let mut store_state = HashMap::new();
        store_state.insert("FOO".to_string(), AtrState::default());
        let r = reconcile(None, Some(ts(20)), store_state, 0.0001);
        assert_eq!(r.source, ReconciliationSource::Sheets);
    }

    #[test]
    fn reconcile_adopts_local_when_only_local_present() {
        let record = sample_record(ts(15));
        let r = reconcile(Some(&record), None, HashMap::new(), 0.0001);
        assert_eq!(r.source, ReconciliationSource::Local);
        assert_eq!(r.last_window, Some(ts(15)));
    }

    #[test]
    fn reconcile_consistent_when_windows_match() {
        let record = sample_record(ts(20));
        let store_state = record.atr_state.clone();
        let r = reconcile(Some(&record), Some(ts(20)), store_state, 0.0001);
        assert_eq!(r.source, ReconciliationSource::Consistent);
    }

    #[test]
    fn reconcile_adopts_local_when_local_ahead_of_store() {
        let record = sample_record(ts(25));
        let r = reconcile(Some(&record), Some(ts(20)), HashMap::new(), 0.0001);
        assert_eq!(r.source, ReconciliationSource::Local);
    }

    #[test]
    fn reconcile_adopts_store_when_store_ahead_of_local() {
        let record = sample_record(ts(15));
        let mut store_state = HashMap::new();
        store_state.insert("FOO".to_string(), AtrState::default());
        let r = reconcile(Some(&record), Some(ts(20)), store_state, 0.0001);
        assert_eq!(r.source, ReconciliationSource::Sheets);
        assert_eq!(r.last_window, Some(ts(20)));
    }
}
