//! Idle connection sweeper
//!
//! Consumer-side workers idle past their threshold are interrupted and close
//! themselves. Provider-side handlers idle past theirs are closed outright. The
//! provider threshold exceeds the consumer one by at least a sweep period, so a
//! close started on the consumer side reaches the provider side first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::registry::SessionRegistry;
use crate::session::CloseReason;
use crate::{Result, TunnelError};

/// Timing of the sweeper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Idle time after which a consumer-side worker is interrupted
    pub consumer_idle_timeout: Duration,
    /// Idle time after which a provider-side handler is closed
    pub provider_idle_timeout: Duration,
}

impl SweeperConfig {
    /// Take the sweeper timing from a gateway config
    #[must_use]
    pub fn from_gateway(config: &GatewayConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            consumer_idle_timeout: config.consumer_idle_timeout,
            provider_idle_timeout: config.provider_idle_timeout,
        }
    }

    /// Validate the timing
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the interval is zero or the provider
    /// threshold is shorter than the consumer threshold plus one interval.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(TunnelError::config("sweep interval must be positive"));
        }
        if self.provider_idle_timeout < self.consumer_idle_timeout + self.interval {
            return Err(TunnelError::config(format!(
                "provider idle timeout ({:?}) must be at least consumer idle timeout ({:?}) plus sweep interval ({:?})",
                self.provider_idle_timeout, self.consumer_idle_timeout, self.interval
            )));
        }
        Ok(())
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::from_gateway(&GatewayConfig::default())
    }
}

/// Queue ids acted on by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Consumer-side workers interrupted
    pub interrupted: Vec<String>,
    /// Provider-side handlers closed
    pub closed: Vec<String>,
    /// Closed provider-side handlers dropped from the registry
    pub pruned: Vec<String>,
}

impl SweepReport {
    /// Whether the sweep did nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.closed.is_empty() && self.pruned.is_empty()
    }
}

/// Periodically reclaims idle sessions of one registry
#[derive(Debug)]
pub struct ConnectionSweeper {
    registry: Arc<SessionRegistry>,
    config: SweeperConfig,
}

impl ConnectionSweeper {
    /// Create a sweeper over `registry`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(registry: Arc<SessionRegistry>, config: SweeperConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { registry, config })
    }

    /// Sweep as of now
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep as of `now`
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for worker in self.registry.consumers() {
            if worker.is_interrupted() || worker.is_closed() {
                continue;
            }
            if worker
                .session()
                .is_idle_at(now, self.config.consumer_idle_timeout)
            {
                tracing::debug!(
                    queue_id = %worker.queue_id(),
                    "interrupting idle consumer session"
                );
                worker.interrupt();
                report.interrupted.push(worker.queue_id().to_string());
            }
        }

        for handler in self.registry.providers() {
            if handler.is_closed() {
                // Left behind while its relay connection was still shared
                self.registry.remove_provider(handler.queue_id());
                report.pruned.push(handler.queue_id().to_string());
                continue;
            }
            if handler
                .session()
                .is_idle_at(now, self.config.provider_idle_timeout)
            {
                tracing::debug!(queue_id = %handler.queue_id(), "closing idle provider session");
                handler.close(CloseReason::IdleTimeout).await;
                report.closed.push(handler.queue_id().to_string());
            }
        }

        if !report.is_empty() {
            tracing::info!(
                interrupted = report.interrupted.len(),
                closed = report.closed.len(),
                pruned = report.pruned.len(),
                "idle sessions swept"
            );
        }
        report
    }

    /// Run sweeps every interval until `shutdown` is cancelled
    ///
    /// The first sweep happens one interval after the call.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.config.interval;
            let mut ticker = tokio::time::interval_at(start, self.config.interval);

            tracing::info!(
                interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
                "starting connection sweeper"
            );

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::info!("connection sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
