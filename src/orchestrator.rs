// =============================================================================
// Orchestrator — lifecycle, scheduling, coordination
// =============================================================================
//
// Bootstraps the session (calendar gate, schema init, startup reconciliation,
// feed connect/subscribe), then drives the scheduler activity through every
// remaining boundary: freeze -> grace -> finalize -> gap-fill -> ATR ->
// enqueue -> checkpoint -> transition. The boundary wait itself polls in 1 s
// slices so it can check feed heartbeat health and, every ~60 s, pull and
// log the feed client's callback-latency report. Each boundary's sub-steps
// run under their own catch so a single failure (e.g. a checkpoint write)
// never blocks the next window's transition.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertManager};
use crate::atr::{AtrEngine, AtrState};
use crate::aggregator::Aggregator;
use crate::calendar::TradingCalendar;
use crate::checkpoint::{self, CheckpointManager, CheckpointRecord};
use crate::config::EngineConfig;
use crate::feed_client::{self, FeedClient};
use crate::gap_fill::GapFiller;
use crate::instrument_master::InstrumentMaster;
use crate::reconnect::{ReconnectConfig, ReconnectOperator};
use crate::row_id;
use crate::store_client::StoreClient;
use crate::tick_buffer::TickBuffer;
use crate::time_grid::TimeGrid;
use crate::types::{EnrichedBar, Severity, WriteBatch};
use crate::write_pipeline::{self, Writer};

const MARKET_DATA_TABLE: &str = "market_data";
const ATR_STATE_TABLE: &str = "atr_state";
const METADATA_TABLE: &str = "metadata";

/// How often the boundary wait loop pulls and logs a feed-latency report.
const LATENCY_REPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

pub struct Orchestrator {
    config: EngineConfig,
    instruments: Arc<InstrumentMaster>,
    calendar: TradingCalendar,
    store: StoreClient,
    checkpoint_mgr: CheckpointManager,
    alerts: Arc<AlertManager>,
    stop: Arc<AtomicBool>,
    last_latency_report: Mutex<Instant>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        instruments: InstrumentMaster,
        calendar: TradingCalendar,
        store: StoreClient,
    ) -> Self {
        let alerts = Arc::new(AlertManager::new(store.clone()));
        let checkpoint_mgr = CheckpointManager::new(config.checkpoint_dir.clone(), config.max_checkpoint_files);
        Self {
            config,
            instruments: Arc::new(instruments),
            calendar,
            store,
            checkpoint_mgr,
            alerts,
            stop: Arc::new(AtomicBool::new(false)),
            last_latency_report: Mutex::new(Instant::now()),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run one trading session end-to-end. Returns once the session ends or
    /// the calendar gate aborts the run.
    pub async fn run(&self) -> Result<()> {
        let today = Utc::now().date_naive();

        // 1. Calendar gate.
        let Some(session) = self.calendar.get_session_hours(today) else {
            info!(date = %today, "non-trading day, aborting run");
            return Ok(());
        };
        info!(open = %session.open, close = %session.close, "session hours resolved");

        // 2. Authenticate feed and store — out of scope; store/feed clients
        //    already carry their credentials from construction.

        // 3. Initialize schema if absent.
        self.init_schema().await;

        // 4. Reconcile startup state.
        let reconciliation = self.reconcile_startup().await;
        info!(source = %reconciliation.source, last_window = ?reconciliation.last_window, "startup reconciliation complete");

        // 5. Install reconciled ATR state.
        let mut atr_engine = AtrEngine::new(self.config.atr_period, self.config.atr_precision);
        atr_engine.load_state(reconciliation.atr_state);

        // 6. Initialize aggregator for the day.
        let grid = TimeGrid::new(session.open, session.close, self.config.candle_interval_minutes);
        let mut aggregator = Aggregator::new(grid.clone());
        let buffer = Arc::new(TickBuffer::new());
        let mut gap_filler = GapFiller::new();

        // 7. Start writer.
        let (tx, rx) = write_pipeline::channel();
        let writer = Writer::new(
            self.store.clone(),
            self.config.spool_path.clone(),
            self.config.max_retries,
            self.config.retry_base_delay_s,
        );
        let writer_handle = tokio::spawn(async move { writer.run(rx).await });

        // 8. Connect and subscribe feed.
        let feed_client = Arc::new(FeedClient::new(
            self.instruments.clone(),
            buffer.clone(),
            self.config.latency_sample_size,
            self.config.callback_latency_warn_us,
            self.config.callback_latency_max_us,
        ));
        self.connect_feed(&feed_client, &grid).await;

        // 9. Skip past already-elapsed boundaries; set aggregator to the
        //    first active window.
        let now = Utc::now();
        let remaining = grid.remaining_boundaries(now);
        let Some(&first_window) = remaining.first() else {
            info!("no remaining boundaries in the session, nothing to do");
            self.shutdown(tx, writer_handle).await;
            return Ok(());
        };
        aggregator.start_session(&buffer, first_window);

        let expected_symbols = self.instruments.all_symbols();

        // 10. Main scheduler loop: one iteration per remaining boundary.
        for (idx, &boundary) in remaining.iter().enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop signal observed, ending session early");
                break;
            }

            self.sleep_until_with_heartbeat(boundary, &feed_client, &grid).await;

            aggregator.freeze(&buffer);
            tokio::time::sleep(self.config.window_freeze()).await;

            let (raw_bars, drop_counts) = aggregator.finalize(&buffer, &expected_symbols);
            if drop_counts.late_ticks > 0 || drop_counts.future_ticks > 0 {
                info!(
                    window = %boundary,
                    late = drop_counts.late_ticks,
                    future = drop_counts.future_ticks,
                    "tick drop summary for window"
                );
            }

            let (filled_bars, unfillable) = gap_filler.fill(raw_bars, &expected_symbols, boundary);
            if !unfillable.is_empty() {
                warn!(window = %boundary, symbols = ?unfillable, "cold-start symbols unfillable this window");
            }

            let instruments = self.instruments.clone();
            let enriched = atr_engine.process_batch(
                &filled_bars,
                |symbol| instruments.segment_of(symbol),
                |symbol, window_start| row_id::row_id(symbol, window_start),
            );

            let atr_rows = atr_state_rows(&atr_engine);
            self.enqueue_batch(&tx, boundary, enriched, atr_rows);

            self.checkpoint_cycle(&atr_engine, boundary, false);

            if let Some(next) = grid.next_boundary(boundary) {
                aggregator.transition_to_next_window(&buffer, next);
            } else if idx + 1 < remaining.len() {
                aggregator.transition_to_next_window(&buffer, remaining[idx + 1]);
            }
        }

        // 11. Session end.
        aggregator.end_session();
        self.checkpoint_cycle(&atr_engine, grid.close(), true);
        self.alerts
            .fire(Alert::new(Severity::Info, "SESSION_END").with_detail("date", today.to_string()))
            .await;

        self.shutdown(tx, writer_handle).await;
        Ok(())
    }

    async fn init_schema(&self) {
        for table in [MARKET_DATA_TABLE, ATR_STATE_TABLE, "system_log", METADATA_TABLE] {
            if let Err(e) = self.store.open_or_create_table(table).await {
                warn!(table, error = %e, "schema init failed for table (continuing, table may already exist)");
            }
        }

        let seed = vec![serde_json::json!({
            "schema_version": "1.0",
            "atr_period": self.config.atr_period,
            "timezone": "IST",
            "tickers_count": self.config.ticker_count,
        })];
        if let Err(e) = self.store.resize(METADATA_TABLE, &seed).await {
            warn!(error = %e, "metadata seed row write failed (non-fatal)");
        }
    }

    async fn reconcile_startup(&self) -> checkpoint::Reconciliation {
        let local = self.checkpoint_mgr.load();

        let store_rows = self.store.get_all_values(MARKET_DATA_TABLE).await.unwrap_or_default();
        let store_max_timestamp = max_timestamp(&store_rows);

        let atr_rows = self.store.get_all_values(ATR_STATE_TABLE).await.unwrap_or_default();
        let store_atr_state = parse_atr_rows(&atr_rows);

        checkpoint::reconcile(local.as_ref(), store_max_timestamp, store_atr_state, self.config.atr_divergence_epsilon)
    }

    async fn connect_feed(&self, feed_client: &Arc<FeedClient>, grid: &TimeGrid) {
        let pairs = self.instruments.subscription_pairs();
        let url = self.config.feed_ws_url.clone();
        let batch_size = self.config.ws_subscribe_batch_size;
        let client = feed_client.clone();
        let grid = grid.clone();

        tokio::spawn(async move {
            if let Err(e) = feed_client::run_feed(
                &url,
                &pairs,
                batch_size,
                std::time::Duration::from_millis(200),
                &client,
                &grid,
            )
            .await
            {
                error!(error = %e, "feed run ended with error");
            }
        });
    }

    /// Sleep until `boundary`, polling in 1 s slices so the heartbeat can be
    /// checked, the stop flag observed promptly, and a latency report pulled
    /// roughly every `LATENCY_REPORT_INTERVAL`.
    async fn sleep_until_with_heartbeat(&self, boundary: DateTime<Utc>, feed_client: &Arc<FeedClient>, grid: &TimeGrid) {
        loop {
            let now = Utc::now();
            if now >= boundary || self.stop.load(Ordering::Relaxed) {
                return;
            }

            let remaining = (boundary - now).to_std().unwrap_or(std::time::Duration::ZERO);
            let slice = remaining.min(std::time::Duration::from_secs(1));
            tokio::time::sleep(slice).await;

            if feed_client.is_unhealthy(self.config.heartbeat_silence_timeout()) {
                warn!("feed heartbeat unhealthy, running reconnect operator");
                self.run_reconnect(feed_client, grid).await;
            }

            self.maybe_report_latency(feed_client);
        }
    }

    /// Pull and log the feed client's callback-latency report once per
    /// `LATENCY_REPORT_INTERVAL`, resetting the ring each time. The report
    /// itself logs warnings when p99/max cross their configured thresholds.
    fn maybe_report_latency(&self, feed_client: &Arc<FeedClient>) {
        let mut last = self.last_latency_report.lock();
        if last.elapsed() < LATENCY_REPORT_INTERVAL {
            return;
        }
        *last = Instant::now();
        drop(last);

        let report = feed_client.latency_report();
        if report.sample_count > 0 {
            info!(
                p50_us = report.p50_us,
                p95_us = report.p95_us,
                p99_us = report.p99_us,
                max_us = report.max_us,
                samples = report.sample_count,
                "feed callback latency report"
            );
        }
    }

    async fn run_reconnect(&self, feed_client: &Arc<FeedClient>, grid: &TimeGrid) {
        let reconnect_cfg = ReconnectConfig::from_engine_config(&self.config);
        let operator = ReconnectOperator::new(reconnect_cfg, self.alerts.clone());

        let url = self.config.feed_ws_url.clone();
        let pairs = self.instruments.subscription_pairs();
        let batch_size = self.config.ws_subscribe_batch_size;
        let grid = grid.clone();

        // `refresh` and `connect`/`subscribe` collapse onto the same
        // `run_feed` call here, since the upstream auth handshake is out of
        // scope — a fresh connection is both "connect" and "subscribe" in
        // one network round trip.
        operator
            .run(
                || async { Ok(()) },
                move || {
                    let client = feed_client.clone();
                    let url = url.clone();
                    let pairs = pairs.clone();
                    let grid = grid.clone();
                    async move {
                        // The full read loop is re-spawned after the probe
                        // succeeds so the reconnect operator's own attempt
                        // doesn't block on an unbounded stream read.
                        tokio::spawn(async move {
                            let _ = feed_client::run_feed(
                                &url,
                                &pairs,
                                batch_size,
                                std::time::Duration::from_millis(200),
                                &client,
                                &grid,
                            )
                            .await;
                        });
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(())
                    }
                },
                || async { Ok(()) },
            )
            .await;
    }

    fn enqueue_batch(
        &self,
        tx: &tokio::sync::mpsc::UnboundedSender<WriteBatch>,
        window_start: DateTime<Utc>,
        rows: Vec<EnrichedBar>,
        atr_rows: Vec<Value>,
    ) {
        let batch = WriteBatch { window_start, rows, atr_rows };
        if tx.send(batch).is_err() {
            error!(window = %window_start, "write queue closed, batch dropped");
        }
    }

    fn checkpoint_cycle(&self, atr_engine: &AtrEngine, last_window: DateTime<Utc>, sheets_write_confirmed: bool) {
        let record = CheckpointRecord {
            last_window,
            atr_state: atr_engine.export_state(),
            saved_at: Utc::now(),
            sheets_write_confirmed,
        };
        if let Err(e) = self.checkpoint_mgr.save(&record) {
            error!(error = %e, window = %last_window, "checkpoint write failed (next cycle retries)");
        }
    }

    async fn shutdown(&self, tx: tokio::sync::mpsc::UnboundedSender<WriteBatch>, writer_handle: tokio::task::JoinHandle<()>) {
        drop(tx); // sentinel: closes the channel so the writer's recv returns None
        if tokio::time::timeout(std::time::Duration::from_secs(30), writer_handle)
            .await
            .is_err()
        {
            warn!("writer did not shut down within 30s timeout");
        }
    }
}

fn max_timestamp(rows: &[Value]) -> Option<DateTime<Utc>> {
    rows.iter()
        .filter_map(|row| row.get("timestamp").and_then(Value::as_str))
        .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .max()
}

/// Build the `atr_state` "latest view" rows from the engine's current
/// export. Attached to each `WriteBatch` so the writer can overwrite the
/// table itself, right after this batch's market-data append is confirmed.
fn atr_state_rows(atr_engine: &AtrEngine) -> Vec<Value> {
    atr_engine
        .export_state()
        .iter()
        .map(|(symbol, state)| {
            serde_json::json!({
                "ticker": symbol,
                "last_close": state.prev_close,
                "last_atr": state.prev_atr,
                "last_timestamp": state.last_timestamp.map(|ts| ts.to_rfc3339()),
                "updated_at": Utc::now().to_rfc3339(),
            })
        })
        .collect()
}

fn parse_atr_rows(rows: &[Value]) -> HashMap<String, AtrState> {
    rows.iter()
        .filter_map(|row| {
            let ticker = row.get("ticker")?.as_str()?.to_string();
            let last_close = row.get("last_close").and_then(Value::as_f64);
            let last_atr = row.get("last_atr").and_then(Value::as_f64);
            let last_timestamp = row
                .get("last_timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            Some((
                ticker,
                AtrState {
                    prev_close: last_close,
                    prev_atr: last_atr,
                    tr_history: Vec::new(),
                    candle_count: if last_atr.is_some() { 14 } else { 0 },
                    last_timestamp,
                },
            ))
        })
        .collect()
}
