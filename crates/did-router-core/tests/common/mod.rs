//! Shared fixtures for the router integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use did_router_core::config::RoutingConfig;
use did_router_core::stats::{CallCounts, DidCounts};
use did_router_core::{
    CallRecord, CallState, Did, DidRouter, NewProvider, NoopPbxConfig, Provider, ProviderRegistry, RouterError,
    RouterStore, SqliteStore,
};

/// In-memory store plus a router on top of it
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub router: DidRouter,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_routing(RoutingConfig::default()).await
    }

    pub async fn with_routing(routing: RoutingConfig) -> Self {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let router = router_on(store.clone(), &routing).await;
        Self { store, router }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.router.registry()
    }

    /// Register a provider and give it `dids`
    pub async fn provider(&self, name: &str, dids: &[&str]) -> Provider {
        let provider = self
            .registry()
            .add(NewProvider::new(name, "10.0.0.1"))
            .await
            .unwrap();
        if !dids.is_empty() {
            self.registry().add_dids(name, &numbers(dids), None).await.unwrap();
        }
        provider
    }

    /// Every DID is in use exactly when one open call holds it
    pub async fn assert_lease_invariant(&self) {
        let rows: Vec<(String, bool, i64)> = sqlx::query_as(
            "SELECT d.did, d.in_use, \
                    (SELECT COUNT(*) FROM call_records c \
                     WHERE c.assigned_did = d.did AND c.status NOT IN ('COMPLETED', 'FAILED')) \
             FROM dids d",
        )
        .fetch_all(self.store.pool())
        .await
        .unwrap();

        for (did, in_use, open_calls) in rows {
            if in_use {
                assert_eq!(open_calls, 1, "leased DID {} must be held by exactly one open call", did);
            } else {
                assert_eq!(open_calls, 0, "free DID {} must not be held by an open call", did);
            }
        }
    }

    /// Status column of a call as persisted
    pub async fn stored_status(&self, call_id: &str) -> String {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM call_records WHERE call_id = ?")
            .bind(call_id)
            .fetch_one(self.store.pool())
            .await
            .unwrap();
        status
    }

    /// Push a call's persisted start time into the past
    pub async fn backdate(&self, call_id: &str, minutes: i64) {
        backdate(&self.store, call_id, minutes).await;
    }
}

pub async fn router_on(store: Arc<dyn RouterStore>, routing: &RoutingConfig) -> DidRouter {
    let registry = ProviderRegistry::load(store.clone(), Arc::new(NoopPbxConfig))
        .await
        .unwrap();
    DidRouter::new(store, Arc::new(registry), routing).await.unwrap()
}

pub async fn backdate(store: &SqliteStore, call_id: &str, minutes: i64) {
    sqlx::query("UPDATE call_records SET start_time = start_time - ? WHERE call_id = ?")
        .bind(minutes * 60_000)
        .bind(call_id)
        .execute(store.pool())
        .await
        .unwrap();
}

pub fn numbers(dids: &[&str]) -> Vec<String> {
    dids.iter().map(|d| d.to_string()).collect()
}

/// Store that fails the next `n` stale-call queries, then delegates
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    stale_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            stale_failures: AtomicUsize::new(0),
        }
    }

    pub fn fail_stale_queries(&self, n: usize) {
        self.stale_failures.store(n, Ordering::SeqCst);
    }

    pub fn pending_failures(&self) -> usize {
        self.stale_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouterStore for FlakyStore {
    async fn upsert_provider(&self, provider: &Provider) -> did_router_core::Result<Provider> {
        self.inner.upsert_provider(provider).await
    }

    async fn load_active_providers(&self) -> did_router_core::Result<Vec<Provider>> {
        self.inner.load_active_providers().await
    }

    async fn provider_dids(&self, provider_id: i64) -> did_router_core::Result<Vec<Did>> {
        self.inner.provider_dids(provider_id).await
    }

    async fn upsert_dids(&self, provider: &Provider, dids: &[String], country: Option<&str>) -> did_router_core::Result<()> {
        self.inner.upsert_dids(provider, dids, country).await
    }

    async fn lease_did(&self, did_id: i64, destination: &str, call: Option<&CallRecord>) -> did_router_core::Result<bool> {
        self.inner.lease_did(did_id, destination, call).await
    }

    async fn release_did(&self, did: &str) -> did_router_core::Result<Option<String>> {
        self.inner.release_did(did).await
    }

    async fn update_call_status(&self, call_id: &str, from: CallState, to: CallState) -> did_router_core::Result<bool> {
        self.inner.update_call_status(call_id, from, to).await
    }

    async fn finish_call(
        &self,
        call_id: &str,
        from: CallState,
        to: CallState,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> did_router_core::Result<bool> {
        self.inner.finish_call(call_id, from, to, end_time, duration).await
    }

    async fn get_call(&self, call_id: &str) -> did_router_core::Result<Option<CallRecord>> {
        self.inner.get_call(call_id).await
    }

    async fn find_open_call_by_did(&self, did: &str, since: DateTime<Utc>) -> did_router_core::Result<Option<CallRecord>> {
        self.inner.find_open_call_by_did(did, since).await
    }

    async fn load_open_calls(&self, since: DateTime<Utc>) -> did_router_core::Result<Vec<CallRecord>> {
        self.inner.load_open_calls(since).await
    }

    async fn stale_calls(&self, cutoff: DateTime<Utc>) -> did_router_core::Result<Vec<CallRecord>> {
        let failing = self
            .stale_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RouterError::Store(sqlx::Error::PoolTimedOut));
        }
        self.inner.stale_calls(cutoff).await
    }

    async fn did_counts(&self, provider_id: Option<i64>) -> did_router_core::Result<DidCounts> {
        self.inner.did_counts(provider_id).await
    }

    async fn call_counts(&self, provider_id: Option<i64>, since: DateTime<Utc>) -> did_router_core::Result<CallCounts> {
        self.inner.call_counts(provider_id, since).await
    }
}
