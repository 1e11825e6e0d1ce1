//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TALLY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TALLY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TALLY_LOG";
/// Environment variable selecting the aggregator mode (`once` or `schedule`).
pub const AGGREGATOR_MODE_ENV_VAR: &str = "TALLY_AGGREGATOR_MODE";

use serde::Deserialize;

use crate::aggregation::AggregationConfig;
use crate::bus::MessagingConfig;
use crate::dlq::DlqConfig;
use crate::mirror::{MirrorConfig, MirrorType};
use crate::object_store::ObjectStoreConfig;
use crate::replication::ReplicationConfig;
use crate::snapshot::CompactionConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Message bus backend.
    pub messaging: MessagingConfig,
    /// Queue names and redelivery bound for the replication consumer.
    pub replication: ReplicationConfig,
    /// Dead-letter publishing.
    pub dlq: DlqConfig,
    /// Where snapshots are stored.
    pub object_store: ObjectStoreConfig,
    /// Relational summary tables.
    pub mirror: MirrorConfig,
    pub aggregation: AggregationConfig,
    pub compaction: CompactionConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("aggregation.tenants")
                    .with_list_parse_key("compaction.tenants")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would only fail later, at first use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mirror.mirror_type != MirrorType::None && self.mirror.url.is_empty() {
            return Err(ConfigError::Invalid(
                "mirror.url is required when a mirror type is set".to_string(),
            ));
        }
        if self.mirror.legacy_table.is_some() && self.mirror.mirror_type == MirrorType::None {
            return Err(ConfigError::Invalid(
                "mirror.legacy_table needs a relational mirror".to_string(),
            ));
        }
        if self.replication.max_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "replication.max_deliveries must be at least 1".to_string(),
            ));
        }
        if self.aggregation.interval_secs == 0 || self.compaction.interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".to_string()));
        }
        Ok(())
    }

    /// Tenants whose transaction snapshots the compactor retires.
    pub fn compaction_tenants(&self) -> Vec<String> {
        self.compaction
            .tenants
            .clone()
            .unwrap_or_else(|| self.aggregation.tenants.clone())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
