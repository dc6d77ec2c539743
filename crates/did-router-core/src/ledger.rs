//! Call ledger
//!
//! Tracks every routed call through its lifecycle. Open calls are indexed in
//! memory by call id and by assigned DID; the store is the source of truth and
//! backs lookups for calls that are not (or no longer) in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, RouterError};
use crate::registry::ProviderRegistry;
use crate::store::RouterStore;
use crate::types::{CallRecord, CallState, Lease};

/// An incoming call about to be routed
#[derive(Debug, Clone)]
pub struct NewCall {
    pub call_id: String,
    pub ani: String,
    pub dnis: String,
}

#[derive(Default)]
struct LedgerState {
    calls: HashMap<String, CallRecord>,
    /// assigned DID -> call id
    by_did: HashMap<String, String>,
}

impl LedgerState {
    fn insert(&mut self, record: CallRecord) {
        self.by_did.insert(record.assigned_did.clone(), record.call_id.clone());
        self.calls.insert(record.call_id.clone(), record);
    }

    fn evict(&mut self, call_id: &str) -> Option<CallRecord> {
        let record = self.calls.remove(call_id)?;
        if self.by_did.get(&record.assigned_did).map(String::as_str) == Some(call_id) {
            self.by_did.remove(&record.assigned_did);
        }
        Some(record)
    }
}

/// Lifecycle tracker for routed calls
pub struct CallLedger {
    store: Arc<dyn RouterStore>,
    state: RwLock<LedgerState>,
    match_window: chrono::Duration,
    recording_dir: Option<String>,
}

impl CallLedger {
    /// Build a ledger and restore the open calls still inside the match window
    pub async fn load(
        store: Arc<dyn RouterStore>,
        match_window: Duration,
        recording_dir: Option<String>,
    ) -> Result<Self> {
        let match_window = chrono::Duration::from_std(match_window)
            .map_err(|e| RouterError::Config(format!("return match window out of range: {}", e)))?;
        let ledger = Self {
            store,
            state: RwLock::new(LedgerState::default()),
            match_window,
            recording_dir: recording_dir.filter(|dir| !dir.trim().is_empty()),
        };
        ledger.restore(Utc::now()).await?;
        Ok(ledger)
    }

    /// Reload open calls started within the match window before `now`
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<usize> {
        let calls = self.store.load_open_calls(now - self.match_window).await?;
        let restored = calls.len();

        let mut state = self.state.write().await;
        for call in calls {
            state.insert(call);
        }
        info!("Restored {} open calls", restored);
        Ok(restored)
    }

    /// Lease a DID for `call` and persist the ACTIVE record
    ///
    /// The lease and the call row are committed together, so a rejected call
    /// never leaves a DID marked in use.
    pub async fn record_new_call(
        &self,
        registry: &ProviderRegistry,
        call: &NewCall,
        provider: Option<&str>,
    ) -> Result<CallRecord> {
        if self.state.read().await.calls.contains_key(&call.call_id) {
            return Err(RouterError::DuplicateCall(call.call_id.clone()));
        }

        let started = Utc::now();
        let (_, record) = registry
            .lease_did_for_call(provider, &call.dnis, |lease| self.draft(call, lease, started))
            .await?;

        self.state.write().await.insert(record.clone());
        info!(
            "Call {} from {} to {} assigned DID {} via {}",
            record.call_id, record.original_ani, record.original_dnis, record.assigned_did, record.provider_name
        );
        Ok(record)
    }

    fn draft(&self, call: &NewCall, lease: &Lease, started: DateTime<Utc>) -> CallRecord {
        CallRecord {
            call_id: call.call_id.clone(),
            original_ani: call.ani.clone(),
            original_dnis: call.dnis.clone(),
            assigned_did: lease.did.clone(),
            provider_id: lease.provider.id,
            provider_name: lease.provider.name.clone(),
            status: CallState::Active,
            start_time: started,
            end_time: None,
            duration: 0,
            recording_path: self.recording_path(&call.call_id),
        }
    }

    /// Where the PBX records `call_id`, if recording is configured
    pub fn recording_path(&self, call_id: &str) -> Option<String> {
        self.recording_dir
            .as_ref()
            .map(|dir| format!("{}/{}.wav", dir.trim_end_matches('/'), call_id))
    }

    /// The open call currently holding `did`
    pub async fn find_by_did(&self, did: &str) -> Result<CallRecord> {
        self.find_by_did_at(did, Utc::now()).await
    }

    /// The open call holding `did`, matching store rows started within the window before `now`
    pub async fn find_by_did_at(&self, did: &str, now: DateTime<Utc>) -> Result<CallRecord> {
        {
            let state = self.state.read().await;
            if let Some(record) = state.by_did.get(did).and_then(|call_id| state.calls.get(call_id)) {
                return Ok(record.clone());
            }
        }

        match self.store.find_open_call_by_did(did, now - self.match_window).await? {
            Some(record) => {
                debug!("Call {} for DID {} recovered from store", record.call_id, did);
                self.state.write().await.insert(record.clone());
                Ok(record)
            }
            None => Err(RouterError::UnknownDid(did.to_string())),
        }
    }

    /// Look up a call by id, open or finished
    pub async fn get(&self, call_id: &str) -> Result<CallRecord> {
        if let Some(record) = self.state.read().await.calls.get(call_id) {
            return Ok(record.clone());
        }
        self.store
            .get_call(call_id)
            .await?
            .ok_or_else(|| RouterError::CallNotFound(call_id.to_string()))
    }

    /// Move a call to `next`
    pub async fn transition(&self, call_id: &str, next: CallState) -> Result<CallRecord> {
        self.transition_at(call_id, next, Utc::now()).await
    }

    /// Move a call to `next`, stamping terminal states with `now`
    ///
    /// Terminal transitions free the DID in the same store transaction and
    /// drop the call from the memory index.
    pub async fn transition_at(&self, call_id: &str, next: CallState, now: DateTime<Utc>) -> Result<CallRecord> {
        let mut state = self.state.write().await;

        let current = match state.calls.get(call_id) {
            Some(record) => record.clone(),
            None => self
                .store
                .get_call(call_id)
                .await?
                .ok_or_else(|| RouterError::CallNotFound(call_id.to_string()))?,
        };

        if !current.status.can_transition_to(next) {
            return Err(RouterError::InvalidTransition {
                call_id: call_id.to_string(),
                from: current.status,
                to: next,
            });
        }

        let mut updated = current.clone();
        updated.status = next;

        if next.is_terminal() {
            let duration = (now - current.start_time).num_seconds().max(0);
            if !self.store.finish_call(call_id, current.status, next, now, duration).await? {
                state.evict(call_id);
                warn!("Call {} changed underneath us while moving to {}", call_id, next);
                return Err(RouterError::ConcurrentUpdate(call_id.to_string()));
            }
            updated.end_time = Some(now);
            updated.duration = duration;
            state.evict(call_id);
        } else {
            if !self.store.update_call_status(call_id, current.status, next).await? {
                state.evict(call_id);
                warn!("Call {} changed underneath us while moving to {}", call_id, next);
                return Err(RouterError::ConcurrentUpdate(call_id.to_string()));
            }
            state.insert(updated.clone());
        }

        info!("Call {}: {} -> {}", call_id, current.status, next);
        Ok(updated)
    }

    /// Number of calls held in the memory index
    pub async fn active_count(&self) -> usize {
        self.state.read().await.calls.len()
    }

    /// ACTIVE or FORWARDED calls started before `cutoff`
    pub async fn stale_calls(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        self.store.stale_calls(cutoff).await
    }
}
