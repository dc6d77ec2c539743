//! DID router service host
//!
//! Opens the store, restores providers and open calls, runs the reclaimer and
//! periodically logs routing statistics until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use did_router_core::logging::{log_welcome, setup_logging};
use did_router_core::{DidRoutingService, RouterConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "did-routerd")]
#[command(about = "DID leasing and call correlation service", version)]
pub struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DID_ROUTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Seconds between statistics reports, 0 disables them
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RouterConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    setup_logging(&config.logging)?;
    log_welcome("did-routerd", env!("CARGO_PKG_VERSION"));

    let service = DidRoutingService::start(&config)
        .await
        .context("starting DID routing service")?;
    let router = service.router().clone();

    for provider in router.list_providers().await {
        info!("📡 Provider {} -> {}:{} ({})", provider.name, provider.host, provider.port, provider.trunk_name());
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let report_every = Duration::from_secs(args.stats_interval_secs.max(1));
    let mut ticker = tokio::time::interval(report_every);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("waiting for shutdown signal")?;
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick(), if args.stats_interval_secs > 0 => {
                let stats = router.stats().await;
                info!(
                    "📊 active calls: {}, DIDs: {}/{} in use, calls today: {} ({} completed)",
                    stats.active_calls, stats.used_dids, stats.total_dids, stats.calls_today, stats.completed_calls
                );
            }
        }
    }

    service.shutdown().await;
    Ok(())
}
