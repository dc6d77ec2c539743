//! Core types for the DID router

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default SIP port applied when a provider omits one
pub const DEFAULT_SIP_PORT: u16 = 5060;
/// Default SIP transport
pub const DEFAULT_TRANSPORT: &str = "udp";
/// Default channel capacity hint
pub const DEFAULT_MAX_CHANNELS: u32 = 100;

/// Codecs applied when a provider omits them
pub fn default_codecs() -> Vec<String> {
    vec!["ulaw".to_string(), "alaw".to_string()]
}

/// Outbound trunk name for a provider
pub fn trunk_name(provider_name: &str) -> String {
    format!("trunk-{}", provider_name)
}

/// Upstream carrier owning a pool of DIDs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub realm: Option<String>,
    pub transport: String,
    pub codecs: Vec<String>,
    /// Advisory only, leasing does not enforce it
    pub max_channels: u32,
    pub active: bool,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    /// Trunk this provider's calls are dispatched on
    pub fn trunk_name(&self) -> String {
        trunk_name(&self.name)
    }
}

/// Request to add or update a provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProvider {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    pub transport: Option<String>,
    #[serde(default)]
    pub codecs: Vec<String>,
    pub max_channels: Option<u32>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub country: Option<String>,
}

fn default_active() -> bool {
    true
}

impl NewProvider {
    /// Minimal active provider, everything else defaulted
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            active: true,
            ..Default::default()
        }
    }
}

/// A leasable phone number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Did {
    pub id: i64,
    pub did: String,
    pub provider_id: i64,
    pub provider_name: String,
    pub in_use: bool,
    /// DNIS the number is currently leased for
    pub destination: Option<String>,
    pub country: Option<String>,
}

/// A DID granted to one caller
#[derive(Debug, Clone)]
pub struct Lease {
    pub did: String,
    pub did_id: i64,
    /// Provider whose inventory held the number
    pub provider: Provider,
    pub destination: String,
}

/// Call lifecycle state
///
/// `ACTIVE -> FORWARDED -> RETURNED -> COMPLETED`, with `FAILED` reachable from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallState {
    Active,
    Forwarded,
    Returned,
    Completed,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Active => "ACTIVE",
            CallState::Forwarded => "FORWARDED",
            CallState::Returned => "RETURNED",
            CallState::Completed => "COMPLETED",
            CallState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(CallState::Active),
            "FORWARDED" => Some(CallState::Forwarded),
            "RETURNED" => Some(CallState::Returned),
            "COMPLETED" => Some(CallState::Completed),
            "FAILED" => Some(CallState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            CallState::Active => 0,
            CallState::Forwarded => 1,
            CallState::Returned => 2,
            CallState::Completed | CallState::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the sequence monotonic
    pub fn can_transition_to(&self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == CallState::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle record of one routed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub original_ani: String,
    pub original_dnis: String,
    pub assigned_did: String,
    pub provider_id: i64,
    pub provider_name: String,
    pub status: CallState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end, zero until terminal
    pub duration: i64,
    pub recording_path: Option<String>,
}

/// Routing answer handed back to the signaling layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub status: String,
    pub did_assigned: String,
    pub next_hop: String,
    pub ani_to_send: String,
    pub dnis_to_send: String,
    pub provider_name: String,
    pub trunk_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_moves_are_allowed() {
        assert!(CallState::Active.can_transition_to(CallState::Forwarded));
        assert!(CallState::Active.can_transition_to(CallState::Returned));
        assert!(CallState::Forwarded.can_transition_to(CallState::Returned));
        assert!(CallState::Returned.can_transition_to(CallState::Completed));
        assert!(CallState::Active.can_transition_to(CallState::Completed));
    }

    #[test]
    fn failed_reachable_from_any_open_state() {
        for state in [CallState::Active, CallState::Forwarded, CallState::Returned] {
            assert!(state.can_transition_to(CallState::Failed), "{} -> FAILED", state);
        }
    }

    #[test]
    fn backward_and_terminal_moves_are_rejected() {
        assert!(!CallState::Returned.can_transition_to(CallState::Active));
        assert!(!CallState::Returned.can_transition_to(CallState::Forwarded));
        assert!(!CallState::Forwarded.can_transition_to(CallState::Forwarded));
        for terminal in [CallState::Completed, CallState::Failed] {
            for next in [
                CallState::Active,
                CallState::Forwarded,
                CallState::Returned,
                CallState::Completed,
                CallState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn state_names_round_trip_through_store_encoding() {
        for state in [
            CallState::Active,
            CallState::Forwarded,
            CallState::Returned,
            CallState::Completed,
            CallState::Failed,
        ] {
            assert_eq!(CallState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CallState::parse("active"), None);
    }

    #[test]
    fn provider_trunk_name() {
        assert_eq!(trunk_name("p1"), "trunk-p1");
    }
}
