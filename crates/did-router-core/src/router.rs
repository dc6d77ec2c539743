//! # DID Router
//!
//! Entry point for the signaling layer. An incoming call is assigned a DID
//! from a provider's pool and forwarded with its addressing rewritten
//! (`ANI := original DNIS`, `DNIS := leased DID`). When the call comes back
//! carrying that DID, the router restores the original caller and dialed
//! number and hands the call to the return trunk.
//!
//! ```text
//! caller ──► process_incoming ──► trunk-<provider>  (ANI=dnis, DNIS=did)
//!                                        │
//! return ◄── process_return(did) ◄───────┘  (ANI=original ani, DNIS=original dnis)
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{Result, RouterError};
use crate::ledger::{CallLedger, NewCall};
use crate::registry::ProviderRegistry;
use crate::selection::{FirstActiveProvider, ProviderSelector};
use crate::stats::{start_of_day, CallCounts, DidCounts, ProviderStats, SystemStats};
use crate::store::RouterStore;
use crate::types::{trunk_name, CallRecord, CallResponse, CallState, Provider};

const RESPONSE_SUCCESS: &str = "success";

/// Routes incoming calls and correlates their return legs
pub struct DidRouter {
    store: Arc<dyn RouterStore>,
    registry: Arc<ProviderRegistry>,
    ledger: Arc<CallLedger>,
    selector: Arc<dyn ProviderSelector>,
    return_trunk: String,
}

impl DidRouter {
    /// Create a router, restoring open calls from the store
    pub async fn new(
        store: Arc<dyn RouterStore>,
        registry: Arc<ProviderRegistry>,
        config: &RoutingConfig,
    ) -> Result<Self> {
        let ledger = CallLedger::load(
            store.clone(),
            config.return_match_window(),
            config.recording_dir.clone(),
        )
        .await?;

        Ok(Self {
            store,
            registry,
            ledger: Arc::new(ledger),
            selector: Arc::new(FirstActiveProvider),
            return_trunk: config.return_trunk.clone(),
        })
    }

    /// Replace the provider selection policy
    pub fn with_selector(mut self, selector: Arc<dyn ProviderSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<CallLedger> {
        &self.ledger
    }

    /// Route a new incoming call
    pub async fn process_incoming(&self, call_id: &str, ani: &str, dnis: &str) -> Result<CallResponse> {
        let call = NewCall {
            call_id: required("call_id", call_id)?,
            ani: required("ani", ani)?,
            dnis: required("dnis", dnis)?,
        };

        let candidates = self.registry.active_providers().await;
        let selected = self.selector.select(&call.dnis, &candidates);

        let record = match self
            .ledger
            .record_new_call(&self.registry, &call, selected.as_deref())
            .await
        {
            Err(RouterError::DidExhausted { .. }) if selected.is_some() => {
                warn!(
                    "Provider {} has no free DIDs, falling back to any provider",
                    selected.as_deref().unwrap_or_default()
                );
                self.ledger.record_new_call(&self.registry, &call, None).await?
            }
            other => other?,
        };

        Ok(CallResponse {
            status: RESPONSE_SUCCESS.to_string(),
            did_assigned: record.assigned_did.clone(),
            next_hop: trunk_name(&record.provider_name),
            ani_to_send: record.original_dnis.clone(),
            dnis_to_send: record.assigned_did.clone(),
            provider_name: record.provider_name.clone(),
            trunk_name: trunk_name(&record.provider_name),
        })
    }

    /// Correlate a returning call by the DID it was forwarded with
    ///
    /// `ani2` is not used for matching.
    pub async fn process_return(&self, ani2: &str, did: &str) -> Result<CallResponse> {
        let ani2 = required("ani2", ani2)?;
        let did = required("did", did)?;

        let record = self.ledger.find_by_did(&did).await?;
        let record = if record.status == CallState::Returned {
            debug!("Call {} already returned, repeating routing answer", record.call_id);
            record
        } else {
            self.ledger.transition(&record.call_id, CallState::Returned).await?
        };

        info!(
            "Return leg for DID {} (ANI2 {}) matched call {}, restoring {} -> {}",
            did, ani2, record.call_id, record.original_ani, record.original_dnis
        );

        Ok(CallResponse {
            status: RESPONSE_SUCCESS.to_string(),
            did_assigned: record.assigned_did.clone(),
            next_hop: self.return_trunk.clone(),
            ani_to_send: record.original_ani.clone(),
            dnis_to_send: record.original_dnis.clone(),
            provider_name: record.provider_name.clone(),
            trunk_name: self.return_trunk.clone(),
        })
    }

    /// Record that a call left on its provider trunk
    pub async fn mark_forwarded(&self, call_id: &str) -> Result<CallRecord> {
        self.ledger.transition(call_id.trim(), CallState::Forwarded).await
    }

    /// Finish a call normally, freeing its DID
    pub async fn complete_call(&self, call_id: &str) -> Result<CallRecord> {
        self.finish(call_id.trim(), CallState::Completed).await
    }

    /// Abandon a call, freeing its DID
    pub async fn fail_call(&self, call_id: &str) -> Result<CallRecord> {
        self.finish(call_id.trim(), CallState::Failed).await
    }

    async fn finish(&self, call_id: &str, state: CallState) -> Result<CallRecord> {
        let record = self.ledger.transition(call_id, state).await?;
        self.registry.mark_released(&record.assigned_did).await;
        Ok(record)
    }

    /// System-wide counters; store failures degrade to zeros
    pub async fn stats(&self) -> SystemStats {
        let now = Utc::now();

        let mut providers = Vec::new();
        for provider in self.registry.list().await {
            match self.registry.stats(&provider.name).await {
                Ok(stats) => providers.push(stats),
                Err(e) => warn!("Skipping stats for provider {}: {}", provider.name, e),
            }
        }

        let dids = self.store.did_counts(None).await.unwrap_or_else(|e| {
            warn!("DID counts unavailable: {}", e);
            DidCounts::default()
        });
        let calls = self.store.call_counts(None, start_of_day(now)).await.unwrap_or_else(|e| {
            warn!("Call counts unavailable: {}", e);
            CallCounts::default()
        });

        SystemStats {
            active_calls: self.ledger.active_count().await,
            total_dids: dids.total,
            used_dids: dids.used,
            available_dids: dids.available(),
            calls_today: calls.total,
            completed_calls: calls.completed,
            providers,
            timestamp: now,
        }
    }

    pub async fn list_providers(&self) -> Vec<Provider> {
        self.registry.list().await
    }

    pub async fn provider_stats(&self, name: &str) -> Result<ProviderStats> {
        self.registry.stats(name.trim()).await
    }
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RouterError::validation(format!("missing parameter: {}", field)));
    }
    Ok(value.to_string())
}
