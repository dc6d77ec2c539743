//! Service assembly
//!
//! Wires the store, registry, router and reclaimer together in dependency
//! order. Every component is fully loaded from the store before the router is
//! handed out.

use std::sync::Arc;

use tracing::info;

use crate::config::RouterConfig;
use crate::error::Result;
use crate::pbx::{NoopPbxConfig, PbxConfigGenerator};
use crate::reclaimer::{Reclaimer, ReclaimerHandle};
use crate::registry::ProviderRegistry;
use crate::router::DidRouter;
use crate::store::{RouterStore, SqliteStore};

/// A running DID routing service
pub struct DidRoutingService {
    router: Arc<DidRouter>,
    reclaimer: Option<ReclaimerHandle>,
}

impl DidRoutingService {
    /// Open the configured SQLite database and start the service
    pub async fn start(config: &RouterConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database).await?;
        store.migrate().await?;
        info!("Database ready at {}", config.database.url);

        Self::with_store(Arc::new(store), config, Arc::new(NoopPbxConfig)).await
    }

    /// Start the service on an existing store
    pub async fn with_store(
        store: Arc<dyn RouterStore>,
        config: &RouterConfig,
        pbx: Arc<dyn PbxConfigGenerator>,
    ) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::load(store.clone(), pbx).await?);
        let router = Arc::new(DidRouter::new(store, registry, &config.routing).await?);

        let reclaimer = if config.reclaimer.enabled {
            Some(Arc::new(Reclaimer::new(&router, &config.reclaimer)?).spawn())
        } else {
            info!("Reclaimer disabled");
            None
        };

        info!("✅ DID routing service started");
        Ok(Self { router, reclaimer })
    }

    pub fn router(&self) -> &Arc<DidRouter> {
        &self.router
    }

    /// Stop background tasks
    pub async fn shutdown(mut self) {
        if let Some(reclaimer) = self.reclaimer.take() {
            reclaimer.stop().await;
        }
        info!("🛑 DID routing service stopped");
    }
}
