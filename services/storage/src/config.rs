use crate::tier::{SharedChain, Tier, TierChain, TierLimits};
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors found while validating configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the tiering service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Sweeper loop configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Cameras that own recordings
    #[serde(default)]
    pub cameras: Vec<String>,
    /// Tier chains, one per storage category
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply bundled migrations on startup (development databases only)
    #[serde(default)]
    pub run_migrations: bool,
}

/// API configuration for the health/usage endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Sweeper worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Poll interval for tiers that do not set their own
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,
    /// First backoff delay after a failed pass
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound for the backoff delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Consecutive failed passes before a worker is reported degraded
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,
    /// Untracked files younger than this are left alone by reconciliation
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
    /// Run reconciliation before the workers start
    #[serde(default = "default_true")]
    pub reconcile_on_startup: bool,
    /// Capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// One tier chain
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Storage category (e.g. "recorder", "event_clips")
    pub category: String,
    /// Tiers in order; the last one is terminal
    pub tiers: Vec<TierConfig>,
}

/// One tier of a chain
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    /// Absolute root directory
    pub path: PathBuf,
    pub max_age_secs: Option<u64>,
    pub max_size_bytes: Option<u64>,
    pub min_age_secs: Option<u64>,
    pub min_size_bytes: Option<u64>,
    #[serde(default)]
    pub move_on_shutdown: bool,
    /// Overrides `sweeper.default_poll_interval_secs`
    pub poll_interval_secs: Option<u64>,
}

// Default value functions
fn default_service_name() -> String {
    "storage-tiering".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_degraded_after_failures() -> u32 {
    3
}

fn default_orphan_grace_secs() -> u64 {
    3600
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "storage-tiering")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/tiering").required(false))
            .add_source(config::File::with_name("/etc/tiering/tiering").required(false))
            // TIERING__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("TIERING")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration. Runs before any worker is spawned.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.sweeper.default_poll_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sweeper.default_poll_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }

        if self.sweeper.retry_base_delay_ms > self.sweeper.retry_max_delay_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "sweeper.retry_base_delay_ms".to_string(),
                message: "Base delay exceeds sweeper.retry_max_delay_ms".to_string(),
            });
        }

        let mut cameras = HashSet::new();
        for camera in &self.cameras {
            if camera.is_empty() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "cameras".to_string(),
                    message: "Camera identifier must not be empty".to_string(),
                });
            }
            if !cameras.insert(camera) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "cameras".to_string(),
                    message: format!("Duplicate camera identifier {camera}"),
                });
            }
        }

        let mut categories = HashSet::new();
        let mut paths = HashSet::new();
        for (c, chain) in self.chains.iter().enumerate() {
            if chain.category.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "chains[{c}].category"
                )));
            }
            if !categories.insert(&chain.category) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("chains[{c}].category"),
                    message: format!("Duplicate category {}", chain.category),
                });
            }
            if chain.tiers.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "chains[{c}].tiers"
                )));
            }

            for (t, tier) in chain.tiers.iter().enumerate() {
                let field = |name: &str| format!("chains[{c}].tiers[{t}].{name}");

                if tier.path.as_os_str().is_empty() {
                    return Err(ConfigValidationError::MissingField(field("path")));
                }
                if !tier.path.is_absolute() {
                    return Err(ConfigValidationError::InvalidValue {
                        field: field("path"),
                        message: "Tier path must be absolute".to_string(),
                    });
                }
                // Nested roots would make one tier's files count in another's aggregate
                if paths
                    .iter()
                    .any(|p: &&PathBuf| p.starts_with(&tier.path) || tier.path.starts_with(p))
                {
                    return Err(ConfigValidationError::InvalidValue {
                        field: field("path"),
                        message: format!("{} overlaps another tier", tier.path.display()),
                    });
                }
                paths.insert(&tier.path);

                if let (Some(min), Some(max)) = (tier.min_size_bytes, tier.max_size_bytes) {
                    if min > max {
                        return Err(ConfigValidationError::InvalidValue {
                            field: field("min_size_bytes"),
                            message: format!("min_size_bytes {min} exceeds max_size_bytes {max}"),
                        });
                    }
                }
                if tier.poll_interval_secs == Some(0) {
                    return Err(ConfigValidationError::InvalidValue {
                        field: field("poll_interval_secs"),
                        message: "Interval must be greater than 0".to_string(),
                    });
                }
                for (name, secs) in [
                    ("max_age_secs", tier.max_age_secs),
                    ("min_age_secs", tier.min_age_secs),
                ] {
                    if secs.is_some_and(|s| s > i64::MAX as u64 / 1000) {
                        return Err(ConfigValidationError::InvalidValue {
                            field: field(name),
                            message: "Duration out of range".to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve validated configuration into immutable tier chains
    pub fn chains(&self) -> Result<Vec<SharedChain>, ConfigValidationError> {
        self.validate()?;

        let chains = self
            .chains
            .iter()
            .map(|chain| {
                let tiers = chain
                    .tiers
                    .iter()
                    .map(|tier| Tier {
                        index: 0,
                        path: tier.path.clone(),
                        limits: TierLimits {
                            max_age: tier.max_age_secs.map(secs_to_chrono),
                            max_size: tier.max_size_bytes,
                            min_age: tier.min_age_secs.map(secs_to_chrono),
                            min_size: tier.min_size_bytes,
                        },
                        move_on_shutdown: tier.move_on_shutdown,
                        poll_interval: Duration::from_secs(
                            tier.poll_interval_secs
                                .unwrap_or(self.sweeper.default_poll_interval_secs),
                        ),
                    })
                    .collect();
                Arc::new(TierChain::new(chain.category.clone(), tiers))
            })
            .collect();

        Ok(chains)
    }
}

impl SweeperConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

fn secs_to_chrono(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(secs as i64)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_secs: default_poll_interval_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            degraded_after_failures: default_degraded_after_failures(),
            orphan_grace_secs: default_orphan_grace_secs(),
            reconcile_on_startup: true,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(path: &str) -> TierConfig {
        TierConfig {
            path: PathBuf::from(path),
            max_age_secs: None,
            max_size_bytes: None,
            min_age_secs: None,
            min_size_bytes: None,
            move_on_shutdown: false,
            poll_interval_secs: None,
        }
    }

    fn config(tiers: Vec<TierConfig>) -> Config {
        Config {
            service: ServiceConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/tiering".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: false,
            },
            api: ApiConfig::default(),
            sweeper: SweeperConfig::default(),
            cameras: vec!["cam1".to_string()],
            chains: vec![ChainConfig {
                category: "recorder".to_string(),
                tiers,
            }],
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_poll_interval_secs(), 60);
        assert_eq!(default_degraded_after_failures(), 3);
        assert!(!SweeperConfig::default().retry_base_delay().is_zero());
    }

    #[test]
    fn test_valid_chain_resolves() {
        let mut first = tier("/tmp/tier1");
        first.max_size_bytes = Some(100);
        first.min_age_secs = Some(30);
        first.poll_interval_secs = Some(5);

        let chains = config(vec![first, tier("/tmp/tier2")]).chains().unwrap();
        assert_eq!(chains.len(), 1);

        let chain = &chains[0];
        assert_eq!(chain.category, "recorder");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get(0).unwrap().limits.max_size, Some(100));
        assert_eq!(
            chain.get(0).unwrap().limits.min_age,
            Some(ChronoDuration::seconds(30))
        );
        assert_eq!(chain.get(0).unwrap().poll_interval, Duration::from_secs(5));
        assert_eq!(chain.get(1).unwrap().poll_interval, Duration::from_secs(60));
        assert!(chain.is_terminal(1));
    }

    #[test]
    fn test_min_size_above_max_size_rejected() {
        let mut first = tier("/tmp/tier1");
        first.max_size_bytes = Some(100);
        first.min_size_bytes = Some(200);

        let err = config(vec![first]).validate().unwrap_err();
        assert!(matches!(err, ConfigValidationError::InvalidValue { ref field, .. } if field.ends_with("min_size_bytes")));
    }

    #[test]
    fn test_overlapping_paths_rejected() {
        let err = config(vec![tier("/tmp/tier1"), tier("/tmp/tier1/nested")])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_relative_path_rejected() {
        assert!(config(vec![tier("relative/tier")]).validate().is_err());
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert_eq!(
            config(vec![]).validate(),
            Err(ConfigValidationError::MissingField("chains[0].tiers".to_string()))
        );
    }

    #[test]
    fn test_duplicate_camera_rejected() {
        let mut cfg = config(vec![tier("/tmp/tier1")]);
        cfg.cameras.push("cam1".to_string());
        assert!(cfg.validate().is_err());
    }
}
