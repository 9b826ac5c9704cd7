use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::config::EngineConfig;
use crate::error::ProbeError;
use crate::monitor::Probes;
use crate::session_builder::{RunTotals, SessionBuilder, Transition};

/// App name recorded when the window probe fails
pub const UNKNOWN_APP: &str = "unknown";

/// One point-in-time observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub app_name: String,
    pub window_title: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the last user input
    pub idle_seconds: u64,
}

/// Wall clock used to stamp samples
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    /// Delay before the next sample
    pub current_delay: Duration,
}

/// Polls the probes on a fixed interval, backing off while they fail.
pub struct Sampler {
    probes: Probes,
    clock: Arc<dyn Clock>,
    base_interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
    max_backoff: Duration,
    failures: u32,
    health: watch::Sender<SamplerHealth>,
}

impl Sampler {
    #[must_use]
    pub fn new(probes: Probes, config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let base_interval = config.sample_interval();
        let (health, _) = watch::channel(SamplerHealth {
            consecutive_failures: 0,
            degraded: false,
            current_delay: base_interval,
        });
        Self {
            probes,
            clock,
            base_interval,
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.failure_threshold,
            max_backoff: config.max_backoff(),
            failures: 0,
            health,
        }
    }

    #[must_use]
    pub fn health(&self) -> SamplerHealth {
        *self.health.borrow()
    }

    /// Live view of the sampler's health, usable after `run` takes ownership
    #[must_use]
    pub fn subscribe_health(&self) -> watch::Receiver<SamplerHealth> {
        self.health.subscribe()
    }

    /// Poll both probes once. Never fails: a broken window probe yields
    /// [`UNKNOWN_APP`], a broken idle probe yields zero idle time.
    pub async fn sample_once(&mut self) -> Sample {
        let timestamp = self.clock.now();
        let window = self.bounded(self.probes.window.poll()).await;
        let idle = self.bounded(self.probes.idle.idle_seconds()).await;
        let failed = window.is_err() || idle.is_err();

        let (app_name, window_title) = match window {
            Ok(info) if !info.app_name.trim().is_empty() => (info.app_name, info.window_title),
            Ok(_) => (UNKNOWN_APP.to_string(), None),
            Err(e) => {
                log::warn!("Window probe failed: {e}");
                (UNKNOWN_APP.to_string(), None)
            }
        };
        let idle_seconds = idle.unwrap_or_else(|e| {
            log::warn!("Idle probe failed: {e}");
            0
        });

        self.record_outcome(failed);
        Sample {
            app_name,
            window_title,
            timestamp,
            idle_seconds,
        }
    }

    /// Sample until `stop` flips, then force-close the builder and send its
    /// final transitions. Also stops if the recorder hangs up.
    pub async fn run(
        mut self,
        mut builder: SessionBuilder,
        tx: mpsc::UnboundedSender<Transition>,
        mut stop: watch::Receiver<bool>,
    ) -> RunTotals {
        log::info!("Sampler started (interval {:?})", self.base_interval);

        'sampling: loop {
            if *stop.borrow() {
                break;
            }

            let sample = self.sample_once().await;
            log::debug!(
                "Sample: {} (idle {}s) at {}",
                sample.app_name,
                sample.idle_seconds,
                sample.timestamp
            );
            for transition in builder.push(&sample) {
                if tx.send(transition).is_err() {
                    log::error!("Recorder stopped, halting sampling");
                    break 'sampling;
                }
            }

            let delay = self.health().current_delay;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        for transition in builder.finish() {
            if tx.send(transition).is_err() {
                log::warn!("Recorder gone, final transitions dropped");
                break;
            }
        }

        let totals = builder.totals();
        log::info!(
            "Sampler stopped: {}s in sessions, {}s idle, {}s switching, {}s discarded",
            totals.session_seconds,
            totals.idle_seconds,
            totals.switch_seconds,
            totals.discarded_seconds
        );
        totals
    }

    async fn bounded<T>(
        &self,
        probe: impl Future<Output = Result<T, ProbeError>>,
    ) -> Result<T, ProbeError> {
        tokio::time::timeout(self.probe_timeout, probe)
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.probe_timeout)))
    }

    fn record_outcome(&mut self, failed: bool) {
        let was_degraded = self.failures >= self.failure_threshold;
        self.failures = if failed {
            self.failures.saturating_add(1)
        } else {
            0
        };
        let degraded = self.failures >= self.failure_threshold;

        if degraded && !was_degraded {
            log::warn!(
                "Probes failed {} times in a row, backing off",
                self.failures
            );
        } else if was_degraded && !degraded {
            log::info!("Probes recovered, back to {:?} sampling", self.base_interval);
        }

        self.health.send_replace(SamplerHealth {
            consecutive_failures: self.failures,
            degraded,
            current_delay: backoff_delay(
                self.base_interval,
                self.failures,
                self.failure_threshold,
                self.max_backoff,
            ),
        });
    }
}

/// `base * 2^(failures - threshold + 1)` once failures reach the threshold,
/// capped at `max`
#[must_use]
pub fn backoff_delay(base: Duration, failures: u32, threshold: u32, max: Duration) -> Duration {
    if failures < threshold {
        return base;
    }
    let exponent = failures - threshold + 1;
    base.saturating_mul(2_u32.saturating_pow(exponent))
        .min(max)
}
