//! Provider selection strategies

use crate::types::Provider;

/// Picks the provider an incoming call should lease from
///
/// `candidates` are the active providers in registration order. Returning
/// `None` lets the router lease from any active provider.
pub trait ProviderSelector: Send + Sync {
    fn select(&self, destination: &str, candidates: &[Provider]) -> Option<String>;
}

/// Always the first active provider
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstActiveProvider;

impl ProviderSelector for FirstActiveProvider {
    fn select(&self, _destination: &str, candidates: &[Provider]) -> Option<String> {
        candidates.iter().find(|p| p.active).map(|p| p.name.clone())
    }
}
