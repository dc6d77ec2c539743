//! # DID-Router-Core
//!
//! DID leasing and call correlation for a telephony edge router.
//!
//! An incoming call is given a DID (direct inward dial number) from one of
//! the configured providers and forwarded on that provider's trunk with the
//! DID as its dialed number. When the call returns carrying the DID, the
//! router looks up the original caller and dialed number and restores them.
//!
//! This crate provides:
//! - A provider registry that owns DID inventories and grants exclusive leases
//! - A call ledger tracking `ACTIVE -> FORWARDED -> RETURNED -> COMPLETED/FAILED`
//! - A reclaimer that fails abandoned calls and frees their DIDs
//! - SQLite persistence through sqlx, restored on startup
//!
//! ## Example
//!
//! ```no_run
//! use did_router_core::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let service = DidRoutingService::start(&RouterConfig::default()).await?;
//! let router = service.router();
//!
//! router.registry().add(NewProvider::new("p1", "10.0.0.1")).await?;
//! router.registry().add_dids("p1", &["15551230000".to_string()], None).await?;
//!
//! let outbound = router.process_incoming("call-1", "7135550000", "8005551234").await?;
//! let inbound = router.process_return("7135550000", &outbound.did_assigned).await?;
//! assert_eq!(inbound.dnis_to_send, "8005551234");
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pbx;
pub mod reclaimer;
pub mod registry;
pub mod router;
pub mod selection;
pub mod service;
pub mod stats;
pub mod store;
pub mod types;

pub use config::RouterConfig;
pub use error::{ErrorBody, ErrorKind, Result, RouterError};
pub use ledger::{CallLedger, NewCall};
pub use pbx::{NoopPbxConfig, PbxConfigGenerator};
pub use reclaimer::{Reclaimer, ReclaimerHandle, SweepReport};
pub use registry::ProviderRegistry;
pub use router::DidRouter;
pub use selection::{FirstActiveProvider, ProviderSelector};
pub use service::DidRoutingService;
pub use stats::{ProviderStats, SystemStats};
pub use store::{RouterStore, SqliteStore};
pub use types::{CallRecord, CallResponse, CallState, Did, Lease, NewProvider, Provider};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{DatabaseConfig, LoggingConfig, ReclaimerConfig, RouterConfig, RoutingConfig};
    pub use crate::error::{ErrorKind, Result, RouterError};
    pub use crate::pbx::{NoopPbxConfig, PbxConfigGenerator};
    pub use crate::reclaimer::{Reclaimer, SweepReport};
    pub use crate::registry::ProviderRegistry;
    pub use crate::router::DidRouter;
    pub use crate::service::DidRoutingService;
    pub use crate::stats::{ProviderStats, SystemStats};
    pub use crate::store::{RouterStore, SqliteStore};
    pub use crate::types::{CallRecord, CallResponse, CallState, NewProvider, Provider};
}
