// =============================================================================
// Alert Manager — dual-channel fan-out (process log + durable store)
// =============================================================================
//
// Every alert is routed to the process log at its severity, then mirrored
// into the store's `system_log` table. A store-channel failure is caught and
// logged at error level — it must never suppress or crash the log channel.
// The store call is serialized by an internal mutex so log-row ordering
// stays monotonic even when multiple activities fire alerts concurrently.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::store_client::{StoreClient, SystemLogRow};
use crate::types::Severity;

const SYSTEM_LOG_TABLE: &str = "system_log";

/// One alert event, ready to fan out to both channels.
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: Severity,
    pub event: String,
    pub window: Option<String>,
    pub details: serde_json::Value,
}

impl Alert {
    pub fn new(severity: Severity, event: impl Into<String>) -> Self {
        Self {
            severity,
            event: event.into(),
            window: None,
            details: json!({}),
        }
    }

    pub fn with_window(mut self, window: impl Into<String>) -> Self {
        self.window = Some(window.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.details {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

pub struct AlertManager {
    store: StoreClient,
    /// Serializes the store-channel call so concurrent fires still produce
    /// monotonically ordered log rows.
    store_lock: Arc<Mutex<()>>,
}

impl AlertManager {
    pub fn new(store: StoreClient) -> Self {
        Self {
            store,
            store_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Fire an alert into both channels. The log channel always runs; the
    /// store channel's failure is caught and logged, never propagated.
    pub async fn fire(&self, alert: Alert) {
        self.log_channel(&alert);
        self.store_channel(&alert).await;
    }

    fn log_channel(&self, alert: &Alert) {
        match alert.severity {
            Severity::Info => info!(event = %alert.event, window = ?alert.window, details = %alert.details, "alert"),
            Severity::Warning => warn!(event = %alert.event, window = ?alert.window, details = %alert.details, "alert"),
            Severity::Critical => error!(event = %alert.event, window = ?alert.window, details = %alert.details, "alert"),
        }
    }

    async fn store_channel(&self, alert: &Alert) {
        let _guard = self.store_lock.lock().await;

        let row = SystemLogRow {
            timestamp: Utc::now().to_rfc3339(),
            level: alert.severity.to_string(),
            event: alert.event.clone(),
            window: alert.window.clone(),
            details: alert.details.to_string(),
        };

        let value = match serde_json::to_value(&row) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to serialize alert for store channel");
                return;
            }
        };

        if let Err(e) = self.store.append_rows(SYSTEM_LOG_TABLE, &[value]).await {
            error!(error = %e, event = %alert.event, "alert store channel failed (log channel unaffected)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_detail_merges_into_the_details_object() {
        let alert = Alert::new(Severity::Warning, "RECONNECT_ATTEMPT")
            .with_window("2026-01-05T09:20:00Z")
            .with_detail("attempt", 1);
        assert_eq!(alert.details["attempt"], 1);
        assert_eq!(alert.window.as_deref(), Some("2026-01-05T09:20:00Z"));
    }

    #[tokio::test]
    async fn fire_never_panics_when_store_is_unreachable() {
        let store = StoreClient::new("http://127.0.0.1:1", "key", "secret");
        let manager = AlertManager::new(store);
        manager.fire(Alert::new(Severity::Critical, "RECONNECT_EXHAUSTED")).await;
    }
}
