//! Configuration for the DID router
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working in-process configuration. Values can be overridden from the
//! environment with the `DID_ROUTER__` prefix, using `__` between path
//! segments, e.g. `DID_ROUTER__DATABASE__URL=sqlite://router.db?mode=rwc`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RouterError};

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub database: DatabaseConfig,
    pub routing: RoutingConfig,
    pub reclaimer: ReclaimerConfig,
    pub logging: LoggingConfig,
}

/// Persistence store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Upper bound for a single store operation
    pub operation_timeout_ms: u64,
}

/// Call routing settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Next hop reported for return legs
    pub return_trunk: String,
    /// Directory recording paths are derived from, none disables them
    pub recording_dir: Option<String>,
    /// How far back a return leg may still match its call
    pub return_match_window_secs: u64,
}

/// Stale-call sweep settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Age after which an ACTIVE or FORWARDED call is considered abandoned
    pub stale_after_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://did_router.db?mode=rwc".to_string(),
            max_connections: 10,
            operation_timeout_ms: 5_000,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            return_trunk: "trunk-s4".to_string(),
            recording_dir: Some("/var/spool/asterisk/recordings".to_string()),
            return_match_window_secs: 600,
        }
    }
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            stale_after_secs: 600,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl DatabaseConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl RoutingConfig {
    pub fn return_match_window(&self) -> Duration {
        Duration::from_secs(self.return_match_window_secs)
    }
}

impl ReclaimerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl RouterConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DID_ROUTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RouterConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RouterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(RouterError::Config("database.url must not be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(RouterError::Config("database.max_connections must be at least 1".to_string()));
        }
        if self.database.operation_timeout_ms == 0 {
            return Err(RouterError::Config("database.operation_timeout_ms must be at least 1".to_string()));
        }
        if self.reclaimer.interval_secs == 0 {
            return Err(RouterError::Config("reclaimer.interval_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = RouterConfig::default();
        assert_eq!(config.reclaimer.interval(), Duration::from_secs(30));
        assert_eq!(config.reclaimer.stale_after(), Duration::from_secs(600));
        assert_eq!(config.routing.return_match_window(), Duration::from_secs(600));
        assert_eq!(config.routing.return_trunk, "trunk-s4");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_selected_fields() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[database]\nurl = \"sqlite::memory:\"\n\n[reclaimer]\nstale_after_secs = 120\n"
        )
        .unwrap();

        let config = RouterConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.reclaimer.stale_after_secs, 120);
        // untouched sections keep their defaults
        assert_eq!(config.reclaimer.interval_secs, 30);
        assert_eq!(config.routing.return_match_window_secs, 600);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = RouterConfig::default();
        config.reclaimer.interval_secs = 0;
        assert!(matches!(config.validate(), Err(RouterError::Config(_))));
    }

    #[test]
    fn zero_operation_timeout_is_rejected() {
        let mut config = RouterConfig::default();
        config.database.operation_timeout_ms = 0;
        match config.validate() {
            Err(RouterError::Config(message)) => assert!(message.contains("operation_timeout_ms")),
            other => panic!("expected a config error, got {:?}", other),
        }
    }
}
