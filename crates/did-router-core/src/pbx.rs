//! PBX configuration hook
//!
//! The registry calls the configured generator after every provider add so
//! the telephony server can learn about the new trunk. Generation is best
//! effort: a failure is logged by the registry and never undoes the add.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::types::Provider;

/// Renders trunk and dial-plan configuration for a provider and reloads the PBX
///
/// Implementations report failures as [`RouterError::ConfigGeneration`]; any
/// other error is wrapped into one before it is logged.
///
/// [`RouterError::ConfigGeneration`]: crate::error::RouterError::ConfigGeneration
#[async_trait]
pub trait PbxConfigGenerator: Send + Sync {
    async fn apply(&self, provider: &Provider) -> Result<()>;
}

/// Generator that only records the request
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPbxConfig;

#[async_trait]
impl PbxConfigGenerator for NoopPbxConfig {
    async fn apply(&self, provider: &Provider) -> Result<()> {
        debug!("Skipping PBX config for provider {} ({})", provider.name, provider.trunk_name());
        Ok(())
    }
}
