// =============================================================================
// Engine Configuration — immutable settings record with atomic save
// =============================================================================
//
// Central configuration hub for the volatility harvester. Every tunable
// parameter lives here so that the engine's tick-to-window, retry, and
// telemetry behaviour is fully described by one record instead of scattered
// module-level constants.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default = "...")]` so that adding new
// fields never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_candle_interval_minutes() -> i64 {
    5
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_precision() -> u32 {
    4
}

fn default_ticker_count() -> usize {
    178
}

fn default_window_freeze_ms() -> u64 {
    500
}

fn default_late_tick_tolerance_ms() -> u64 {
    200
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_s() -> u64 {
    1
}

fn default_heartbeat_silence_timeout_s() -> u64 {
    30
}

fn default_session_max_age_hours() -> u64 {
    12
}

fn default_ws_subscribe_batch_size() -> usize {
    50
}

fn default_callback_latency_warn_us() -> u64 {
    500
}

fn default_callback_latency_max_us() -> u64 {
    2000
}

fn default_latency_sample_size() -> usize {
    10_000
}

fn default_max_checkpoint_files() -> usize {
    3
}

fn default_checkpoint_dir() -> String {
    "data/checkpoints".to_string()
}

fn default_spool_path() -> String {
    "data/unsent_backup.json".to_string()
}

fn default_instrument_master_path() -> String {
    "config/instruments.json".to_string()
}

fn default_calendar_dir() -> String {
    "data/calendars".to_string()
}

fn default_reconnect_base_delay_s() -> f64 {
    2.0
}

fn default_reconnect_max_delay_s() -> f64 {
    60.0
}

fn default_reconnect_backoff_factor() -> f64 {
    2.0
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_reconnect_alert_threshold() -> u32 {
    3
}

fn default_reconnect_jitter() -> bool {
    true
}

fn default_atr_divergence_epsilon() -> f64 {
    0.0001
}

fn default_feed_ws_url() -> String {
    "wss://feed.example/ws".to_string()
}

fn default_store_base_url() -> String {
    "https://store.example/api/v1".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level, immutable configuration for the harvester engine.
///
/// Built once at startup and handed to every component constructor by
/// reference or `Arc`. Every field has a serde default so that older JSON
/// files missing new fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Width of one aggregation window, in minutes.
    #[serde(default = "default_candle_interval_minutes")]
    pub candle_interval_minutes: i64,

    /// Number of periods in the Wilder ATR smoothing.
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Decimal places ATR and TR values are rounded to.
    #[serde(default = "default_atr_precision")]
    pub atr_precision: u32,

    /// Expected instrument count, used for finalize-time coverage warnings.
    #[serde(default = "default_ticker_count")]
    pub ticker_count: usize,

    /// Grace period after a boundary during which in-flight ticks for the
    /// just-closed window are still admitted.
    #[serde(default = "default_window_freeze_ms")]
    pub window_freeze_ms: u64,

    /// Defined for configuration-schema completeness; intentionally unused
    /// by the tick-admission logic, which treats `window_freeze_ms` as the
    /// sole admission window.
    #[serde(default = "default_late_tick_tolerance_ms")]
    pub late_tick_tolerance_ms: u64,

    /// Maximum write-retry attempts before spooling to fallback.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for write-retry exponential backoff, in seconds.
    #[serde(default = "default_retry_base_delay_s")]
    pub retry_base_delay_s: u64,

    /// Feed silence duration after which the heartbeat reports unhealthy.
    #[serde(default = "default_heartbeat_silence_timeout_s")]
    pub heartbeat_silence_timeout_s: u64,

    /// Maximum age of an authenticated session before it is treated as
    /// stale.
    #[serde(default = "default_session_max_age_hours")]
    pub session_max_age_hours: u64,

    /// Subscription batch size sent to the feed per request.
    #[serde(default = "default_ws_subscribe_batch_size")]
    pub ws_subscribe_batch_size: usize,

    /// p99 callback latency above which a warning is emitted, in
    /// microseconds.
    #[serde(default = "default_callback_latency_warn_us")]
    pub callback_latency_warn_us: u64,

    /// Max callback latency above which a warning is emitted, in
    /// microseconds.
    #[serde(default = "default_callback_latency_max_us")]
    pub callback_latency_max_us: u64,

    /// Size of the latency ring buffer sampled by the feed client.
    #[serde(default = "default_latency_sample_size")]
    pub latency_sample_size: usize,

    /// Number of rotated checkpoint backups retained alongside the
    /// canonical file.
    #[serde(default = "default_max_checkpoint_files")]
    pub max_checkpoint_files: usize,

    /// Directory holding `checkpoint.json` and its rotated backups.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,

    /// Path to the fallback-spool file for write batches the store
    /// rejected.
    #[serde(default = "default_spool_path")]
    pub spool_path: String,

    /// Path to the static token -> (symbol, segment) instrument master.
    #[serde(default = "default_instrument_master_path")]
    pub instrument_master_path: String,

    /// Directory holding `holidays_YYYY.json` calendar files.
    #[serde(default = "default_calendar_dir")]
    pub calendar_dir: String,

    /// Reconnect operator: base backoff delay, in seconds.
    #[serde(default = "default_reconnect_base_delay_s")]
    pub reconnect_base_delay_s: f64,

    /// Reconnect operator: maximum backoff delay, in seconds.
    #[serde(default = "default_reconnect_max_delay_s")]
    pub reconnect_max_delay_s: f64,

    /// Reconnect operator: multiplicative backoff factor per attempt.
    #[serde(default = "default_reconnect_backoff_factor")]
    pub reconnect_backoff_factor: f64,

    /// Reconnect operator: attempts before giving up entirely.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,

    /// Reconnect operator: attempt count at/above which alerts escalate to
    /// CRITICAL while still retrying.
    #[serde(default = "default_reconnect_alert_threshold")]
    pub reconnect_alert_threshold: u32,

    /// Reconnect operator: whether to apply uniform [0.75, 1.25] jitter to
    /// each computed delay.
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: bool,

    /// Maximum |Δatr| between local and store ATR state tolerated without a
    /// divergence warning during consistent-state reconciliation.
    #[serde(default = "default_atr_divergence_epsilon")]
    pub atr_divergence_epsilon: f64,

    /// WebSocket URL for the upstream feed. The transport and its auth
    /// handshake are out of scope; this is just the connection target.
    #[serde(default = "default_feed_ws_url")]
    pub feed_ws_url: String,

    /// Base URL for the durable store's signed REST interface.
    #[serde(default = "default_store_base_url")]
    pub store_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            candle_interval_minutes: default_candle_interval_minutes(),
            atr_period: default_atr_period(),
            atr_precision: default_atr_precision(),
            ticker_count: default_ticker_count(),
            window_freeze_ms: default_window_freeze_ms(),
            late_tick_tolerance_ms: default_late_tick_tolerance_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_s: default_retry_base_delay_s(),
            heartbeat_silence_timeout_s: default_heartbeat_silence_timeout_s(),
            session_max_age_hours: default_session_max_age_hours(),
            ws_subscribe_batch_size: default_ws_subscribe_batch_size(),
            callback_latency_warn_us: default_callback_latency_warn_us(),
            callback_latency_max_us: default_callback_latency_max_us(),
            latency_sample_size: default_latency_sample_size(),
            max_checkpoint_files: default_max_checkpoint_files(),
            checkpoint_dir: default_checkpoint_dir(),
            spool_path: default_spool_path(),
            instrument_master_path: default_instrument_master_path(),
            calendar_dir: default_calendar_dir(),
            reconnect_base_delay_s: default_reconnect_base_delay_s(),
            reconnect_max_delay_s: default_reconnect_max_delay_s(),
            reconnect_backoff_factor: default_reconnect_backoff_factor(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_alert_threshold: default_reconnect_alert_threshold(),
            reconnect_jitter: default_reconnect_jitter(),
            atr_divergence_epsilon: default_atr_divergence_epsilon(),
            feed_ws_url: default_feed_ws_url(),
            store_base_url: default_store_base_url(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    pub fn window_freeze(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.window_freeze_ms)
    }

    pub fn heartbeat_silence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_silence_timeout_s)
    }
}
