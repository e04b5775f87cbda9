// =============================================================================
// Reconnect Operator — backoff, jitter, escalating alerts
// =============================================================================
//
// Takes three async callbacks (`refresh`, `connect`, `subscribe`) and retries
// them with exponential backoff up to `max_attempts`. Fires alerts through
// the shared `AlertManager` as the attempt count crosses the thresholds the
// spec defines; never reimplements a separate, simpler retry loop at the
// call site — callers always go through this operator.
// =============================================================================

use std::future::Future;

use rand::Rng;
use tracing::info;

use crate::alert::{Alert, AlertManager};
use crate::types::Severity;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub base_delay: std::time::Duration,
    pub max_delay: std::time::Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    pub jitter: bool,
    pub alert_threshold: u32,
}

impl ReconnectConfig {
    pub fn from_engine_config(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            base_delay: std::time::Duration::from_secs_f64(cfg.reconnect_base_delay_s),
            max_delay: std::time::Duration::from_secs_f64(cfg.reconnect_max_delay_s),
            backoff_factor: cfg.reconnect_backoff_factor,
            max_attempts: cfg.reconnect_max_attempts,
            jitter: cfg.reconnect_jitter,
            alert_threshold: cfg.reconnect_alert_threshold,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32 - 1);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let scaled = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        std::time::Duration::from_secs_f64(scaled.max(0.0))
    }
}

pub struct ReconnectOperator {
    config: ReconnectConfig,
    alerts: std::sync::Arc<AlertManager>,
}

impl ReconnectOperator {
    pub fn new(config: ReconnectConfig, alerts: std::sync::Arc<AlertManager>) -> Self {
        Self { config, alerts }
    }

    /// Run the reconnect protocol. `refresh`, `connect`, and `subscribe` are
    /// each retried together as one attempt. Returns `true` on success,
    /// `false` once `max_attempts` is exhausted.
    pub async fn run<FRefresh, FRefreshFut, FConnect, FConnectFut, FSubscribe, FSubscribeFut>(
        &self,
        mut refresh: FRefresh,
        mut connect: FConnect,
        mut subscribe: FSubscribe,
    ) -> bool
    where
        FRefresh: FnMut() -> FRefreshFut,
        FRefreshFut: Future<Output = anyhow::Result<()>>,
        FConnect: FnMut() -> FConnectFut,
        FConnectFut: Future<Output = anyhow::Result<()>>,
        FSubscribe: FnMut() -> FSubscribeFut,
        FSubscribeFut: Future<Output = anyhow::Result<()>>,
    {
        for attempt in 1..=self.config.max_attempts {
            let delay = self.config.delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;

            let outcome: anyhow::Result<()> = async {
                refresh().await?;
                connect().await?;
                subscribe().await?;
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    if attempt > 1 {
                        self.alerts
                            .fire(
                                Alert::new(Severity::Info, "RECONNECT_RECOVERED")
                                    .with_detail("attempts_taken", attempt),
                            )
                            .await;
                        info!(attempts_taken = attempt, "reconnect succeeded");
                    }
                    return true;
                }
                Err(e) => {
                    if attempt == 1 {
                        self.alerts
                            .fire(
                                Alert::new(Severity::Warning, "RECONNECT_ATTEMPT")
                                    .with_detail("attempt", attempt)
                                    .with_detail("error", e.to_string()),
                            )
                            .await;
                    }
                    if attempt >= self.config.alert_threshold {
                        self.alerts
                            .fire(
                                Alert::new(Severity::Critical, "RECONNECT_FAILING")
                                    .with_detail("attempt", attempt)
                                    .with_detail("error", e.to_string()),
                            )
                            .await;
                    }
                }
            }
        }

        self.alerts
            .fire(Alert::new(Severity::Critical, "RECONNECT_EXHAUSTED").with_detail("max_attempts", self.config.max_attempts))
            .await;
        false
    }
}
