//! Stale lease reclamation
//!
//! Calls that never come back (or whose signaling was lost) would hold their
//! DID forever. The reclaimer periodically fails ACTIVE and FORWARDED calls
//! older than the staleness threshold, which frees their DIDs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReclaimerConfig;
use crate::error::{Result, RouterError};
use crate::ledger::CallLedger;
use crate::registry::ProviderRegistry;
use crate::router::DidRouter;
use crate::types::CallState;

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Calls found past the threshold
    pub stale: usize,
    /// Calls moved to FAILED
    pub failed: usize,
    /// DIDs returned to the in-memory pool
    pub released: usize,
}

/// Periodic sweeper of abandoned calls
pub struct Reclaimer {
    ledger: Arc<CallLedger>,
    registry: Arc<ProviderRegistry>,
    stale_after: chrono::Duration,
    interval: Duration,
}

impl Reclaimer {
    pub fn new(router: &DidRouter, config: &ReclaimerConfig) -> Result<Self> {
        if config.interval_secs == 0 {
            return Err(RouterError::Config("reclaimer.interval_secs must be at least 1".to_string()));
        }
        let stale_after = chrono::Duration::from_std(config.stale_after())
            .map_err(|e| RouterError::Config(format!("reclaimer.stale_after_secs out of range: {}", e)))?;
        Ok(Self {
            ledger: router.ledger().clone(),
            registry: router.registry().clone(),
            stale_after,
            interval: config.interval(),
        })
    }

    /// Sweep against the current time
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Fail every open, unreturned call that started before `now - stale_after`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let stale = self.ledger.stale_calls(now - self.stale_after).await?;
        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };

        for call in stale {
            match self.ledger.transition_at(&call.call_id, CallState::Failed, now).await {
                Ok(failed) => {
                    report.failed += 1;
                    if self.registry.mark_released(&failed.assigned_did).await {
                        report.released += 1;
                    }
                    debug!("Reclaimed DID {} from call {}", failed.assigned_did, failed.call_id);
                }
                Err(e @ (RouterError::Store(_) | RouterError::StoreTimeout { .. })) => return Err(e),
                // Finished or moved on since the query ran
                Err(e) => debug!("Skipping stale call {}: {}", call.call_id, e),
            }
        }

        if report.failed > 0 {
            info!("🧹 Reclaimed {} stale calls ({} DIDs freed)", report.failed, report.released);
        }
        Ok(report)
    }

    /// Run sweeps on a fixed interval until the handle is stopped
    pub fn spawn(self: Arc<Self>) -> ReclaimerHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("🔄 Reclaimer started (every {:?})", self.interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!("Reclaimer sweep failed, retrying next tick: {}", e);
                        }
                    }
                }
            }

            info!("Reclaimer stopped");
        });

        ReclaimerHandle { token, handle }
    }
}

/// Handle to a running reclaimer task
pub struct ReclaimerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Cancel the task and wait for it to exit
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Reclaimer task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
