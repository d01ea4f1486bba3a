//! Configuration loading using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (`config/smd_eb.toml` by default)
//! 3. Environment variables prefixed with `SMD_EB_`, nested keys separated
//!    by a double underscore (`SMD_EB_BUILDER__BATCH_SIZE=50`)
//!
//! # Example
//! ```no_run
//! use smd_eb::config::EbConfig;
//!
//! let config = EbConfig::load()?;
//! config.validate()?;
//! println!("batch size: {}", config.builder.batch_size);
//! # Ok::<(), smd_eb::error::EbError>(())
//! ```

use crate::error::{EbError, EbResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/smd_eb.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SMD_EB_";

/// Retry budget applied to live sources when none is configured.
pub const DEFAULT_LIVE_RETRIES: u32 = 3;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EbConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Chunk reader settings
    #[serde(default)]
    pub reader: ReaderConfig,
    /// Event builder settings
    #[serde(default)]
    pub builder: BuilderConfig,
    /// Distribution settings
    #[serde(default)]
    pub distributor: DistributorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Per-source reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Bytes requested from each source per read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Retries on an empty read; unset means 0, or 3 for live data
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Sleep between retries
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Sources are still being written
    #[serde(default)]
    pub live: bool,
}

/// Event builder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Accepted events per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Stop after this many accepted events (0 = unlimited)
    #[serde(default)]
    pub max_events: usize,
}

/// Batch distribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Number of worker (big-data) ranks
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    /// Number of event-builder nodes fed by the chunk distributor
    #[serde(default = "default_n_eb_nodes")]
    pub n_eb_nodes: usize,
    /// Queued batches per worker channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

// Default value functions
fn default_name() -> String {
    "smd-eb".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chunk_size() -> usize {
    0x100_0000
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    1000
}

fn default_n_workers() -> usize {
    1
}

fn default_n_eb_nodes() -> usize {
    1
}

fn default_channel_capacity() -> usize {
    1
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_retries: None,
            retry_delay: default_retry_delay(),
            live: false,
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_events: 0,
        }
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            n_eb_nodes: default_n_eb_nodes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ReaderConfig {
    /// Retry budget after applying the live-data default.
    #[must_use]
    pub fn effective_max_retries(&self) -> u32 {
        match self.max_retries {
            Some(n) => n,
            None if self.live => DEFAULT_LIVE_RETRIES,
            None => 0,
        }
    }
}

impl EbConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> EbResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> EbResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`EbConfig::load_from`].
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EbConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> EbResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(EbError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.reader.chunk_size == 0 {
            return Err(EbError::Configuration("chunk_size must be > 0".into()));
        }

        if self.builder.batch_size == 0 {
            return Err(EbError::Configuration("batch_size must be > 0".into()));
        }

        if self.distributor.n_workers == 0 {
            return Err(EbError::Configuration("n_workers must be > 0".into()));
        }

        if self.distributor.n_eb_nodes == 0 {
            return Err(EbError::Configuration("n_eb_nodes must be > 0".into()));
        }

        if self.distributor.channel_capacity == 0 {
            return Err(EbError::Configuration(
                "channel_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }
}
