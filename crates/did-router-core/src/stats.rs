//! Typed statistics payloads

use chrono::{DateTime, Utc};
use serde::Serialize;

/// DID inventory counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DidCounts {
    pub total: i64,
    pub used: i64,
}

impl DidCounts {
    pub fn available(&self) -> i64 {
        (self.total - self.used).max(0)
    }
}

/// Call counters for one day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCounts {
    pub total: i64,
    pub completed: i64,
    /// ACTIVE or FORWARDED
    pub active: i64,
}

/// Per-provider statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub total_dids: i64,
    pub used_dids: i64,
    pub available_dids: i64,
    pub calls_today: i64,
    pub active_calls: i64,
}

impl ProviderStats {
    pub fn new(provider: impl Into<String>, dids: DidCounts, calls: CallCounts) -> Self {
        Self {
            provider: provider.into(),
            total_dids: dids.total,
            used_dids: dids.used,
            available_dids: dids.available(),
            calls_today: calls.total,
            active_calls: calls.active,
        }
    }
}

/// System-wide statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    /// Calls currently held in the ledger's memory index
    pub active_calls: usize,
    pub total_dids: i64,
    pub used_dids: i64,
    pub available_dids: i64,
    pub calls_today: i64,
    pub completed_calls: i64,
    pub providers: Vec<ProviderStats>,
    pub timestamp: DateTime<Utc>,
}

/// Start of the UTC day containing `now`
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
