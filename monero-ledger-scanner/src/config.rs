use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "LEDGER_SCANNER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config")]
    Load(#[from] config::ConfigError),
    #[error("Invalid config value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Knobs of the chunk scheduler.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// Bound on chunks in the fetch phase and, separately, on chunks in the scan phase.
    /// A value of 1 selects single-flight mode.
    #[serde(default = "default_pending_chunk_queue_size")]
    pub pending_chunk_queue_size: usize,
    #[serde(default = "default_max_get_blocks_attempts")]
    pub max_get_blocks_attempts: usize,
    /// Number of blocks requested per chunk.
    #[serde(default = "default_max_chunk_size_hint")]
    pub max_chunk_size_hint: u64,
    #[serde(default)]
    pub trusted_daemon: bool,
    #[serde(default = "default_high_height_ok")]
    pub high_height_ok: bool,
    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub retry_max_interval_ms: u64,
}

fn default_pending_chunk_queue_size() -> usize {
    10
}

fn default_max_get_blocks_attempts() -> usize {
    3
}

fn default_max_chunk_size_hint() -> u64 {
    1000
}

fn default_high_height_ok() -> bool {
    true
}

fn default_retry_initial_interval_ms() -> u64 {
    500
}

fn default_retry_max_interval_ms() -> u64 {
    10_000
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            pending_chunk_queue_size: default_pending_chunk_queue_size(),
            max_get_blocks_attempts: default_max_get_blocks_attempts(),
            max_chunk_size_hint: default_max_chunk_size_hint(),
            trusted_daemon: false,
            high_height_ok: default_high_height_ok(),
            retry_initial_interval_ms: default_retry_initial_interval_ms(),
            retry_max_interval_ms: default_retry_max_interval_ms(),
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pending_chunk_queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "pending_chunk_queue_size",
                reason: "must be at least 1",
            });
        }

        if self.max_get_blocks_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_get_blocks_attempts",
                reason: "must be at least 1",
            });
        }

        if self.max_chunk_size_hint == 0 {
            return Err(ConfigError::Invalid {
                field: "max_chunk_size_hint",
                reason: "must be at least 1",
            });
        }

        if self.retry_max_interval_ms < self.retry_initial_interval_ms {
            return Err(ConfigError::Invalid {
                field: "retry_max_interval_ms",
                reason: "must not be smaller than retry_initial_interval_ms",
            });
        }

        Ok(())
    }

    pub fn is_single_flight(&self) -> bool {
        self.pending_chunk_queue_size == 1
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }
}

/// Knobs of the wallet refresh routine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RefreshConfig {
    /// Base depth by which a refresh backs off below the recorded tip after a reorg
    /// reaches past its start.
    #[serde(default = "default_reorg_avoidance_increment")]
    pub reorg_avoidance_increment: u64,
    #[serde(default = "default_max_partialscan_attempts")]
    pub max_partialscan_attempts: usize,
}

fn default_reorg_avoidance_increment() -> u64 {
    10
}

fn default_max_partialscan_attempts() -> usize {
    3
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            reorg_avoidance_increment: default_reorg_avoidance_increment(),
            max_partialscan_attempts: default_max_partialscan_attempts(),
        }
    }
}

impl RefreshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reorg_avoidance_increment == 0 {
            return Err(ConfigError::Invalid {
                field: "reorg_avoidance_increment",
                reason: "must be at least 1",
            });
        }

        if self.max_partialscan_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_partialscan_attempts",
                reason: "must be at least 1",
            });
        }

        Ok(())
    }
}

impl Config {
    /// Read a TOML config file, overlaid with `LEDGER_SCANNER__<SECTION>__<KEY>` environment
    /// variables.
    pub fn read<D>(config_file: D) -> Result<Self, ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        tracing::info!(path = %config_file.display(), "Reading config file");

        let config: Config = config::Config::builder()
            .add_source(config::File::from(config_file))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scanner.validate()?;
        self.refresh.validate()
    }
}
