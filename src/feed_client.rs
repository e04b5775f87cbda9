// =============================================================================
// Feed Client — subscription, tick decoding, heartbeat, latency telemetry
// =============================================================================
//
// Maintains one persistent WebSocket connection (grounded on the same
// tokio-tungstenite pattern used by the exchange trade stream elsewhere in
// this codebase). Subscribes in batches with a brief inter-batch delay to
// avoid throttling. The hot-path callback does no logging and no allocation
// beyond the latency-ring push: decode -> resolve token -> assign window ->
// push into the tick buffer -> record a latency sample.
//
// Feed messages arrive with inconsistent field names across providers (`tk`
// vs `instrument_token`, `ltp` vs `last_traded_price`, `exchange_timestamp`
// vs `ft`/`feed_time`); `decode_tick` is the single recognized-field table
// that normalizes all of them. An unrecognized shape is rejected and counted,
// never panicked on.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::instrument_master::InstrumentMaster;
use crate::tick_buffer::TickBuffer;
use crate::time_grid::TimeGrid;

/// A decoded tick before token resolution: `(token, last_price, exchange_timestamp_ms)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RawTick {
    token: u64,
    last_price: f64,
    exchange_timestamp_ms: i64,
}

/// Normalize a feed message into `RawTick` via an explicit recognized-field
/// table. Returns `None` on an unrecognized shape so the caller can count
/// and drop rather than crash.
fn decode_tick(msg: &Value) -> Option<RawTick> {
    let token = msg
        .get("token")
        .or_else(|| msg.get("tk"))
        .or_else(|| msg.get("instrument_token"))
        .and_then(value_as_u64)?;

    let last_price = msg
        .get("ltp")
        .or_else(|| msg.get("last_traded_price"))
        .and_then(Value::as_f64)?;

    let ts_value = msg
        .get("exchange_timestamp")
        .or_else(|| msg.get("ft"))
        .or_else(|| msg.get("feed_time"))?;

    let exchange_timestamp_ms = parse_timestamp(ts_value)?;

    Some(RawTick {
        token,
        last_price,
        exchange_timestamp_ms,
    })
}

fn value_as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Accept epoch seconds, epoch milliseconds, or an ISO-8601 string.
fn parse_timestamp(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(if n > 10_000_000_000 { n } else { n * 1000 });
    }
    if let Some(f) = v.as_f64() {
        let n = f as i64;
        return Some(if n > 10_000_000_000 { n } else { n * 1000 });
    }
    let s = v.as_str()?;
    if let Ok(n) = s.parse::<i64>() {
        return Some(if n > 10_000_000_000 { n } else { n * 1000 });
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Fixed-capacity ring buffer of callback-latency samples, in microseconds.
/// A plain index-overwrite ring rather than a `VecDeque` so the hot path
/// never shifts elements.
struct LatencyRing {
    samples: Vec<u64>,
    next: usize,
    len: usize,
}

impl LatencyRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity.max(1)],
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, micros: u64) {
        let cap = self.samples.len();
        self.samples[self.next] = micros;
        self.next = (self.next + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    fn snapshot_and_reset(&mut self) -> Vec<u64> {
        let mut out: Vec<u64> = if self.len < self.samples.len() {
            self.samples[..self.len].to_vec()
        } else {
            self.samples.clone()
        };
        out.sort_unstable();
        self.next = 0;
        self.len = 0;
        out
    }
}

/// p50/p95/p99/max over one latency snapshot, in microseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyReport {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
    pub sample_count: usize,
}

fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Drop-reason counters maintained by the feed client's own decode/resolve
/// steps, distinct from the tick buffer's late/future counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedDropCounts {
    pub unrecognized_shape: u64,
    pub unknown_token: u64,
    pub outside_session: u64,
}

struct Inner {
    last_tick_monotonic_ms: AtomicU64,
    total_ticks: AtomicU64,
    drops: Mutex<FeedDropCounts>,
    latency: Mutex<LatencyRing>,
    started_at: Instant,
    connected: std::sync::atomic::AtomicBool,
}

/// Shared, thread-safe feed-client state. The WebSocket read loop owns the
/// connection itself; this struct is the part the scheduler and heartbeat
/// checks also need to reach.
pub struct FeedClient {
    instruments: Arc<InstrumentMaster>,
    buffer: Arc<TickBuffer>,
    inner: Arc<Inner>,
    callback_latency_warn_us: u64,
    callback_latency_max_us: u64,
}

impl FeedClient {
    pub fn new(
        instruments: Arc<InstrumentMaster>,
        buffer: Arc<TickBuffer>,
        latency_sample_size: usize,
        callback_latency_warn_us: u64,
        callback_latency_max_us: u64,
    ) -> Self {
        Self {
            instruments,
            buffer,
            inner: Arc::new(Inner {
                last_tick_monotonic_ms: AtomicU64::new(0),
                total_ticks: AtomicU64::new(0),
                drops: Mutex::new(FeedDropCounts::default()),
                latency: Mutex::new(LatencyRing::new(latency_sample_size)),
                started_at: Instant::now(),
                connected: std::sync::atomic::AtomicBool::new(false),
            }),
            callback_latency_warn_us,
            callback_latency_max_us,
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.started_at.elapsed().as_millis() as u64
    }

    /// Hot-path callback: decode, resolve, assign window, push into the tick
    /// buffer. No logging, no allocation beyond the latency-ring push.
    pub fn on_message(&self, raw: &Value, grid: &TimeGrid) {
        let start = Instant::now();

        let Some(tick) = decode_tick(raw) else {
            self.inner.drops.lock().unrecognized_shape += 1;
            return;
        };

        let Some((symbol, _segment)) = self.instruments.resolve(tick.token) else {
            self.inner.drops.lock().unknown_token += 1;
            return;
        };

        let ts = match chrono::DateTime::from_timestamp_millis(tick.exchange_timestamp_ms) {
            Some(ts) => ts,
            None => {
                self.inner.drops.lock().unrecognized_shape += 1;
                return;
            }
        };

        let window_start = match grid.assign_tick_to_window(ts) {
            Ok(w) => w,
            Err(_) => {
                self.inner.drops.lock().outside_session += 1;
                return;
            }
        };

        self.buffer.update(symbol, tick.last_price, window_start);

        self.inner.total_ticks.fetch_add(1, Ordering::Relaxed);
        self.inner.last_tick_monotonic_ms.store(self.now_ms(), Ordering::Relaxed);

        let elapsed_us = start.elapsed().as_micros() as u64;
        self.inner.latency.lock().push(elapsed_us);
    }

    /// `true` when the feed has been silent for longer than `timeout`.
    pub fn is_unhealthy(&self, timeout: Duration) -> bool {
        let last = self.inner.last_tick_monotonic_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false; // session hasn't received a first tick yet
        }
        let elapsed_ms = self.now_ms().saturating_sub(last);
        elapsed_ms > timeout.as_millis() as u64
    }

    pub fn total_ticks(&self) -> u64 {
        self.inner.total_ticks.load(Ordering::Relaxed)
    }

    pub fn drop_counts(&self) -> FeedDropCounts {
        *self.inner.drops.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    fn mark_connected(&self, value: bool) {
        self.inner.connected.store(value, Ordering::Relaxed);
    }

    /// Compute p50/p95/p99/max over the ring and reset it. Emits warnings
    /// per the configured thresholds.
    pub fn latency_report(&self) -> LatencyReport {
        let sorted = self.inner.latency.lock().snapshot_and_reset();
        if sorted.is_empty() {
            return LatencyReport::default();
        }

        let report = LatencyReport {
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            max_us: *sorted.last().unwrap(),
            sample_count: sorted.len(),
        };

        if report.p99_us > self.callback_latency_warn_us {
            warn!(p99_us = report.p99_us, threshold_us = self.callback_latency_warn_us, "callback p99 latency above warning threshold");
        }
        if report.max_us > self.callback_latency_max_us {
            warn!(max_us = report.max_us, threshold_us = self.callback_latency_max_us, "callback max latency above threshold");
        }

        report
    }
}

/// Open one WebSocket connection and subscribe to `pairs` in batches of
/// `batch_size`, waiting `inter_batch_delay` between each. Then reads
/// messages until the stream ends or errors, calling `on_message` for each
/// text frame that parses as JSON.
pub async fn run_feed(
    url: &str,
    pairs: &[(u64, String)],
    batch_size: usize,
    inter_batch_delay: Duration,
    client: &FeedClient,
    grid: &TimeGrid,
) -> Result<()> {
    info!(url, instrument_count = pairs.len(), "connecting to feed");
    let (ws_stream, _response) = connect_async(url).await.context("feed connection failed")?;
    info!("feed connected");
    client.mark_connected(true);

    let (mut write, mut read) = ws_stream.split();

    for batch in pairs.chunks(batch_size.max(1)) {
        let tokens: Vec<u64> = batch.iter().map(|(t, _)| *t).collect();
        let sub_msg = serde_json::json!({ "action": "subscribe", "tokens": tokens });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .context("failed to send subscription batch")?;
        tokio::time::sleep(inter_batch_delay).await;
    }
    info!(batches = pairs.len().div_ceil(batch_size.max(1)), "subscription complete");

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    client.on_message(&value, grid);
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    client.mark_connected(false);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(h: u32, m: u32, s: u32) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 1, 5, h, m, s).unwrap()
    }

    fn grid() -> TimeGrid {
        TimeGrid::new(ts(9, 15, 0), ts(15, 30, 0), 5)
    }

    fn instruments() -> Arc<InstrumentMaster> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instruments.json");
        std::fs::write(&path, r#"[{"token":1,"symbol":"FOO","segment":"NSE"}]"#).unwrap();
        Arc::new(InstrumentMaster::load(&path).unwrap())
    }

    #[test]
    fn decode_tick_accepts_canonical_field_names() {
        let msg = json!({"token": 1, "ltp": 100.5, "exchange_timestamp": 1700000000});
        let tick = decode_tick(&msg).unwrap();
        assert_eq!(tick.token, 1);
        assert_eq!(tick.last_price, 100.5);
    }

    #[test]
    fn decode_tick_accepts_alternate_field_names() {
        let msg = json!({"tk": "1", "last_traded_price": 101.0, "ft": 1700000000000_i64});
        let tick = decode_tick(&msg).unwrap();
        assert_eq!(tick.token, 1);
        assert_eq!(tick.last_price, 101.0);
    }

    #[test]
    fn decode_tick_rejects_unrecognized_shape() {
        let msg = json!({"foo": "bar"});
        assert!(decode_tick(&msg).is_none());
    }

    #[test]
    fn decode_tick_parses_iso8601_timestamp() {
        let msg = json!({"token": 1, "ltp": 100.0, "feed_time": "2026-01-05T09:20:00Z"});
        let tick = decode_tick(&msg).unwrap();
        assert_eq!(tick.exchange_timestamp_ms, ts(9, 20, 0).timestamp_millis());
    }

    #[test]
    fn on_message_accepts_known_token_within_session() {
        let client = FeedClient::new(instruments(), Arc::new(TickBuffer::new()), 100, 500, 2000);
        client.buffer.set_active_window(ts(9, 15, 0));
        let msg = json!({"token": 1, "ltp": 100.0, "exchange_timestamp": ts(9, 15, 30).timestamp()});
        client.on_message(&msg, &grid());
        assert_eq!(client.total_ticks(), 1);
        assert_eq!(client.drop_counts().unknown_token, 0);
    }

    #[test]
    fn on_message_drops_unknown_token() {
        let client = FeedClient::new(instruments(), Arc::new(TickBuffer::new()), 100, 500, 2000);
        client.buffer.set_active_window(ts(9, 15, 0));
        let msg = json!({"token": 999, "ltp": 100.0, "exchange_timestamp": ts(9, 15, 30).timestamp()});
        client.on_message(&msg, &grid());
        assert_eq!(client.total_ticks(), 0);
        assert_eq!(client.drop_counts().unknown_token, 1);
    }

    #[test]
    fn on_message_drops_outside_session() {
        let client = FeedClient::new(instruments(), Arc::new(TickBuffer::new()), 100, 500, 2000);
        client.buffer.set_active_window(ts(9, 15, 0));
        let msg = json!({"token": 1, "ltp": 100.0, "exchange_timestamp": ts(16, 0, 0).timestamp()});
        client.on_message(&msg, &grid());
        assert_eq!(client.drop_counts().outside_session, 1);
    }

    #[test]
    fn is_unhealthy_before_first_tick_is_false() {
        let client = FeedClient::new(instruments(), Arc::new(TickBuffer::new()), 100, 500, 2000);
        assert!(!client.is_unhealthy(Duration::from_secs(30)));
    }

    #[test]
    fn latency_report_computes_percentiles() {
        let client = FeedClient::new(instruments(), Arc::new(TickBuffer::new()), 100, 500, 2000);
        for v in [10u64, 20, 30, 40, 50] {
            client.inner.latency.lock().push(v);
        }
        let report = client.latency_report();
        assert_eq!(report.sample_count, 5);
        assert_eq!(report.max_us, 50);
    }

    #[test]
    fn latency_ring_wraps_at_capacity() {
        let mut ring = LatencyRing::new(3);
        ring.push(1);
        ring.push(2);
        ring.push(3);
        ring.push(4);
        let snap = ring.snapshot_and_reset();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap, vec![2, 3, 4]);
    }
}
