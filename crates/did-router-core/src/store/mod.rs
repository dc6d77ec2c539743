//! Persistence store for providers, DIDs and call records
//!
//! The registry and the ledger only ever talk to the [`RouterStore`] trait.
//! Writes that must be observed together (marking a DID leased and inserting
//! the call that holds it, or failing a call and freeing its DID) are single
//! trait methods so that implementations can commit them as one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::stats::{CallCounts, DidCounts};
use crate::types::{CallRecord, CallState, Did, Provider};

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Storage operations required by the router
#[async_trait]
pub trait RouterStore: Send + Sync {
    /// Insert or update a provider keyed by name, returning the stored row
    async fn upsert_provider(&self, provider: &Provider) -> Result<Provider>;

    /// All providers flagged active
    async fn load_active_providers(&self) -> Result<Vec<Provider>>;

    /// Every DID owned by a provider
    async fn provider_dids(&self, provider_id: i64) -> Result<Vec<Did>>;

    /// Insert or refresh DIDs for a provider; existing numbers are not duplicated
    async fn upsert_dids(&self, provider: &Provider, dids: &[String], country: Option<&str>) -> Result<()>;

    /// Mark a DID leased for `destination`, inserting `call` in the same transaction
    ///
    /// Returns `false` without writing anything when the row, or any other row
    /// carrying the same number, is already in use.
    async fn lease_did(&self, did_id: i64, destination: &str, call: Option<&CallRecord>) -> Result<bool>;

    /// Clear the lease on every row carrying this number
    ///
    /// Nothing changes while an open call still holds the number; the id of
    /// that call is returned instead.
    async fn release_did(&self, did: &str) -> Result<Option<String>>;

    /// Move a call between non-terminal states; `false` if it was no longer in `from`
    async fn update_call_status(&self, call_id: &str, from: CallState, to: CallState) -> Result<bool>;

    /// Move a call into a terminal state and free its DID in the same transaction
    ///
    /// The DID stays leased if another open call references the same number.
    async fn finish_call(
        &self,
        call_id: &str,
        from: CallState,
        to: CallState,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<bool>;

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>>;

    /// Most recent non-terminal call holding `did` that started after `since`
    async fn find_open_call_by_did(&self, did: &str, since: DateTime<Utc>) -> Result<Option<CallRecord>>;

    /// Non-terminal calls started after `since`
    async fn load_open_calls(&self, since: DateTime<Utc>) -> Result<Vec<CallRecord>>;

    /// ACTIVE or FORWARDED calls started before `cutoff`
    async fn stale_calls(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRecord>>;

    /// DID counters, optionally scoped to one provider
    async fn did_counts(&self, provider_id: Option<i64>) -> Result<DidCounts>;

    /// Call counters since `since`, optionally scoped to one provider
    async fn call_counts(&self, provider_id: Option<i64>, since: DateTime<Utc>) -> Result<CallCounts>;
}
