//! # Provider Registry
//!
//! Owns the set of known providers and each provider's DID inventory, and is
//! the only component that grants or revokes DID leases.
//!
//! ## Lease exclusivity
//!
//! The whole lease sequence runs while the registry's write lock is held:
//!
//! 1. collect unused DIDs of the eligible active providers, skipping any
//!    number that is leased under another provider
//! 2. pick one at random
//! 3. commit the lease to the store with a conditional update (and, for a
//!    routed call, the call record in the same transaction)
//! 4. mark the in-memory copy
//!
//! No other lease attempt can observe the DID as free between steps 2 and 4.
//! If the store reports the row as already taken (another process got there
//! first) the memory copy is corrected and the next candidate is tried.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, RouterError};
use crate::pbx::PbxConfigGenerator;
use crate::stats::{start_of_day, CallCounts, DidCounts, ProviderStats};
use crate::store::RouterStore;
use crate::types::{
    default_codecs, CallRecord, Did, Lease, NewProvider, Provider, DEFAULT_MAX_CHANNELS, DEFAULT_SIP_PORT,
    DEFAULT_TRANSPORT,
};

#[derive(Default)]
struct RegistryState {
    providers: HashMap<String, Provider>,
    /// DIDs keyed by owning provider name
    inventory: HashMap<String, Vec<Did>>,
}

impl RegistryState {
    fn free_candidates(&self, provider: Option<&str>) -> Vec<(String, usize)> {
        let leased: HashSet<&str> = self
            .inventory
            .values()
            .flatten()
            .filter(|did| did.in_use)
            .map(|did| did.did.as_str())
            .collect();

        let mut candidates = Vec::new();
        let eligible = self
            .providers
            .values()
            .filter(|p| p.active && provider.map_or(true, |name| p.name == name));
        for owner in eligible {
            if let Some(dids) = self.inventory.get(&owner.name) {
                for (index, did) in dids.iter().enumerate() {
                    if !did.in_use && !leased.contains(did.did.as_str()) {
                        candidates.push((owner.name.clone(), index));
                    }
                }
            }
        }
        candidates
    }

    fn slot_mut(&mut self, provider: &str, index: usize) -> Option<&mut Did> {
        self.inventory.get_mut(provider).and_then(|dids| dids.get_mut(index))
    }

    /// Clear every in-memory copy of `did`; true if any was leased
    fn clear_lease(&mut self, did: &str) -> bool {
        let mut cleared = false;
        for slot in self.inventory.values_mut().flatten().filter(|slot| slot.did == did) {
            cleared |= slot.in_use;
            slot.in_use = false;
            slot.destination = None;
        }
        cleared
    }

    fn sorted_providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.providers.values().cloned().collect();
        providers.sort_by_key(|p| p.id);
        providers
    }
}

/// Registry of providers and their DID pools
pub struct ProviderRegistry {
    store: Arc<dyn RouterStore>,
    pbx: Arc<dyn PbxConfigGenerator>,
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    /// Build a registry populated from the store
    ///
    /// The registry is only handed out once every active provider and its
    /// DIDs are in memory, so no lease can be served from a partial index.
    pub async fn load(store: Arc<dyn RouterStore>, pbx: Arc<dyn PbxConfigGenerator>) -> Result<Self> {
        let registry = Self {
            store,
            pbx,
            state: RwLock::new(RegistryState::default()),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Replace the in-memory index with the store's view
    pub async fn reload(&self) -> Result<usize> {
        let mut state = self.state.write().await;

        let mut fresh = RegistryState::default();
        for provider in self.store.load_active_providers().await? {
            let dids = self.store.provider_dids(provider.id).await?;
            fresh.inventory.insert(provider.name.clone(), dids);
            fresh.providers.insert(provider.name.clone(), provider);
        }

        let count = fresh.providers.len();
        *state = fresh;
        info!("Loaded {} providers", count);
        Ok(count)
    }

    /// Add or update a provider
    pub async fn add(&self, request: NewProvider) -> Result<Provider> {
        let name = request.name.trim().to_string();
        let host = request.host.trim().to_string();
        if name.is_empty() || host.is_empty() {
            return Err(RouterError::validation("provider name and host are required"));
        }

        let now = Utc::now();
        let draft = Provider {
            id: 0,
            name,
            host,
            port: request.port.filter(|port| *port != 0).unwrap_or(DEFAULT_SIP_PORT),
            username: non_blank(request.username),
            password: non_blank(request.password),
            realm: non_blank(request.realm),
            transport: non_blank(request.transport).unwrap_or_else(|| DEFAULT_TRANSPORT.to_string()),
            codecs: if request.codecs.is_empty() {
                default_codecs()
            } else {
                request.codecs
            },
            max_channels: request.max_channels.unwrap_or(DEFAULT_MAX_CHANNELS),
            active: request.active,
            country: non_blank(request.country),
            created_at: now,
            updated_at: now,
        };

        let provider = {
            let mut state = self.state.write().await;
            let stored = self.store.upsert_provider(&draft).await?;
            let dids = self.store.provider_dids(stored.id).await?;
            state.inventory.insert(stored.name.clone(), dids);
            state.providers.insert(stored.name.clone(), stored.clone());
            stored
        };
        info!("Provider {} added ({}:{})", provider.name, provider.host, provider.port);

        if let Err(e) = self.pbx.apply(&provider).await {
            let failure = match e {
                RouterError::ConfigGeneration { .. } => e,
                other => RouterError::config_generation(provider.name.clone(), other.to_string()),
            };
            warn!("{}", failure);
        }

        Ok(provider)
    }

    /// Attach DIDs to a provider, returning how many were new
    pub async fn add_dids(&self, provider_name: &str, dids: &[String], country: Option<&str>) -> Result<usize> {
        let mut seen = HashSet::new();
        let cleaned: Vec<String> = dids
            .iter()
            .map(|did| did.trim())
            .filter(|did| !did.is_empty() && seen.insert(*did))
            .map(str::to_string)
            .collect();
        if cleaned.is_empty() {
            return Err(RouterError::validation("no DIDs supplied"));
        }

        let mut state = self.state.write().await;
        let provider = state
            .providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| RouterError::ProviderNotFound(provider_name.to_string()))?;
        let before = state.inventory.get(provider_name).map_or(0, Vec::len);

        self.store.upsert_dids(&provider, &cleaned, country).await?;
        let refreshed = self.store.provider_dids(provider.id).await?;
        let added = refreshed.len().saturating_sub(before);
        state.inventory.insert(provider.name.clone(), refreshed);

        info!("Added {} DIDs to provider {} ({} submitted)", added, provider.name, cleaned.len());
        Ok(added)
    }

    /// Lease an unused DID, from `provider` when given or any active provider otherwise
    pub async fn lease_did(&self, provider: Option<&str>, destination: &str) -> Result<Lease> {
        let (lease, _) = self.acquire(provider, destination, |_| None).await?;
        Ok(lease)
    }

    /// Lease a DID and persist the call built by `bind` in the same store transaction
    pub(crate) async fn lease_did_for_call<F>(
        &self,
        provider: Option<&str>,
        destination: &str,
        bind: F,
    ) -> Result<(Lease, CallRecord)>
    where
        F: Fn(&Lease) -> CallRecord + Send + Sync,
    {
        let (lease, record) = self.acquire(provider, destination, |lease| Some(bind(lease))).await?;
        let record = record.ok_or_else(|| RouterError::internal("lease committed without its call record"))?;
        Ok((lease, record))
    }

    async fn acquire<F>(&self, provider: Option<&str>, destination: &str, bind: F) -> Result<(Lease, Option<CallRecord>)>
    where
        F: Fn(&Lease) -> Option<CallRecord> + Send + Sync,
    {
        let mut state = self.state.write().await;

        loop {
            let picked = state.free_candidates(provider).choose(&mut rand::thread_rng()).cloned();
            let Some((owner_name, index)) = picked else {
                debug!("No free DID for {}", provider.unwrap_or("any provider"));
                return Err(RouterError::DidExhausted {
                    provider: provider.map(str::to_string),
                });
            };

            let slot = state.inventory.get(&owner_name).and_then(|dids| dids.get(index)).cloned();
            let owner = state.providers.get(&owner_name).cloned();
            let (Some(slot), Some(owner)) = (slot, owner) else {
                return Err(RouterError::internal(format!("inventory of {} changed mid-lease", owner_name)));
            };

            let lease = Lease {
                did: slot.did.clone(),
                did_id: slot.id,
                provider: owner,
                destination: destination.to_string(),
            };
            let record = bind(&lease);
            let granted = self.store.lease_did(slot.id, destination, record.as_ref()).await?;

            if let Some(entry) = state.slot_mut(&owner_name, index) {
                entry.in_use = true;
                if granted {
                    entry.destination = Some(destination.to_string());
                }
            }

            if granted {
                debug!("Leased DID {} from {} for {}", lease.did, owner_name, destination);
                return Ok((lease, record));
            }
            warn!("DID {} already leased in store, trying another", slot.did);
        }
    }

    /// Return a DID to the pool; releasing a free DID is a no-op
    ///
    /// A DID still held by an open call is refused with [`RouterError::DidHeld`];
    /// finish the call instead, which frees the number with it.
    pub async fn release_did(&self, did: &str) -> Result<()> {
        let did = did.trim();
        let mut state = self.state.write().await;
        if let Some(call_id) = self.store.release_did(did).await? {
            warn!("Refusing to release DID {} held by open call {}", did, call_id);
            return Err(RouterError::DidHeld {
                did: did.to_string(),
                call_id,
            });
        }
        if state.clear_lease(did) {
            info!("Released DID {}", did);
        } else {
            debug!("DID {} was already free", did);
        }
        Ok(())
    }

    /// Drop the in-memory lease of a DID the store has already freed
    pub(crate) async fn mark_released(&self, did: &str) -> bool {
        self.state.write().await.clear_lease(did)
    }

    /// Look up a provider by name
    pub async fn get(&self, name: &str) -> Result<Provider> {
        self.state
            .read()
            .await
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| RouterError::ProviderNotFound(name.to_string()))
    }

    /// All known providers in registration order
    pub async fn list(&self) -> Vec<Provider> {
        self.state.read().await.sorted_providers()
    }

    /// Active providers in registration order
    pub async fn active_providers(&self) -> Vec<Provider> {
        self.state
            .read()
            .await
            .sorted_providers()
            .into_iter()
            .filter(|p| p.active)
            .collect()
    }

    /// In-memory DID inventory of a provider
    pub async fn dids(&self, provider_name: &str) -> Result<Vec<Did>> {
        self.state
            .read()
            .await
            .inventory
            .get(provider_name)
            .cloned()
            .ok_or_else(|| RouterError::ProviderNotFound(provider_name.to_string()))
    }

    /// DID and same-day call counters for a provider
    ///
    /// Store failures degrade to zero counters.
    pub async fn stats(&self, name: &str) -> Result<ProviderStats> {
        let provider = self.get(name).await?;

        let dids = self.store.did_counts(Some(provider.id)).await.unwrap_or_else(|e| {
            warn!("DID counts unavailable for {}: {}", provider.name, e);
            DidCounts::default()
        });
        let calls = self
            .store
            .call_counts(Some(provider.id), start_of_day(Utc::now()))
            .await
            .unwrap_or_else(|e| {
                warn!("Call counts unavailable for {}: {}", provider.name, e);
                CallCounts::default()
            });

        Ok(ProviderStats::new(provider.name, dids, calls))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
