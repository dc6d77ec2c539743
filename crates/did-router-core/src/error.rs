//! Error types for the DID router

use serde::Serialize;
use thiserror::Error;

use crate::types::CallState;

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors that can occur while leasing DIDs and tracking calls
#[derive(Debug, Error)]
pub enum RouterError {
    /// A required field was missing or blank
    #[error("Validation error: {0}")]
    Validation(String),

    /// No provider with this name is known
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// No call with this call id is known
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// No open call holds this DID
    #[error("No active call for DID {0}")]
    UnknownDid(String),

    /// Every candidate DID is already leased
    #[error("No available DIDs{}", .provider.as_ref().map(|p| format!(" for provider {}", p)).unwrap_or_default())]
    DidExhausted { provider: Option<String> },

    /// The call id has already been used
    #[error("Call {0} already exists")]
    DuplicateCall(String),

    /// The requested state change goes backwards or leaves a terminal state
    #[error("Invalid transition for call {call_id}: {from} -> {to}")]
    InvalidTransition {
        call_id: String,
        from: CallState,
        to: CallState,
    },

    /// An open call still holds the DID, so it cannot be released directly
    #[error("DID {did} is held by open call {call_id}")]
    DidHeld { did: String, call_id: String },

    /// The stored call changed underneath us
    #[error("Call {0} was modified concurrently")]
    ConcurrentUpdate(String),

    /// Underlying persistence failure
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A store operation exceeded its time budget and was abandoned
    #[error("Store operation {operation} timed out after {timeout_ms} ms")]
    StoreTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// JSON encoding of a stored column failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PBX configuration could not be generated
    ///
    /// [`PbxConfigGenerator`](crate::pbx::PbxConfigGenerator) implementations
    /// return this; the registry logs it and never fails the provider add.
    #[error("Config generation failed for provider {provider}: {message}")]
    ConfigGeneration { provider: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes a transport can map onto status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    ResourceExhausted,
    Conflict,
    Timeout,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Store => "store",
            ErrorKind::Internal => "internal",
        }
    }
}

impl RouterError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a config generation error for `provider`
    pub fn config_generation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigGeneration {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::Validation(_) => ErrorKind::Validation,
            RouterError::ProviderNotFound(_)
            | RouterError::CallNotFound(_)
            | RouterError::UnknownDid(_) => ErrorKind::NotFound,
            RouterError::DidExhausted { .. } => ErrorKind::ResourceExhausted,
            RouterError::DuplicateCall(_)
            | RouterError::DidHeld { .. }
            | RouterError::InvalidTransition { .. }
            | RouterError::ConcurrentUpdate(_) => ErrorKind::Conflict,
            RouterError::StoreTimeout { .. } => ErrorKind::Timeout,
            RouterError::Store(_) => ErrorKind::Store,
            RouterError::Serialization(_)
            | RouterError::ConfigGeneration { .. }
            | RouterError::Config(_)
            | RouterError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error payload handed to the transport layer
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RouterError> for ErrorBody {
    fn from(err: &RouterError) -> Self {
        Self {
            status: "error",
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_unknown_did_are_distinct() {
        let exhausted = RouterError::DidExhausted { provider: None };
        let unknown = RouterError::UnknownDid("15551230000".to_string());

        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(unknown.kind(), ErrorKind::NotFound);
        assert_ne!(ErrorBody::from(&exhausted).kind, ErrorBody::from(&unknown).kind);
    }

    #[test]
    fn exhaustion_message_names_provider() {
        let err = RouterError::DidExhausted { provider: Some("p1".to_string()) };
        assert_eq!(err.to_string(), "No available DIDs for provider p1");

        let err = RouterError::DidExhausted { provider: None };
        assert_eq!(err.to_string(), "No available DIDs");
    }

    #[test]
    fn held_did_is_a_conflict() {
        let err = RouterError::DidHeld {
            did: "15551230000".to_string(),
            call_id: "call-1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "DID 15551230000 is held by open call call-1");
    }

    #[test]
    fn config_generation_names_provider() {
        let err = RouterError::config_generation("p1", "template missing");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "Config generation failed for provider p1: template missing");
    }
}
