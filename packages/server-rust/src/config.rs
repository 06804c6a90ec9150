//! Server configuration: the JSON config file, CLI overrides, and the
//! validated [`AppConfig`] the binary runs from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use storinfo_core::{PageLimits, Thresholds};
use tracing::info;

use crate::cache::{CacheConfig, MAX_FETCH_PAGE_SIZE};
use crate::network::NetworkConfig;
use crate::store::RecordFeed;

/// Port used when neither the config file nor the command line names one.
pub const DEFAULT_PORT: u16 = 8080;

/// Errors detected while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{name} must be between 0 and 100, got {value}")]
    Threshold { name: &'static str, value: f64 },

    #[error("{name} must be between 1 and {max}, got {value}")]
    PageSize {
        name: &'static str,
        value: usize,
        max: usize,
    },

    #[error("defaultPageSize ({default}) exceeds maxPageSize ({max})")]
    DefaultAboveMax { default: usize, max: usize },

    #[error("storageInterval must be greater than zero")]
    ZeroInterval,

    #[error("no record source configured: set databaseUrl or testMorayData")]
    NoSource,
}

// ---------------------------------------------------------------------------
// Config file
// ---------------------------------------------------------------------------

/// The on-disk JSON config. Every key is optional; unknown keys are ignored
/// so one file can be shared with sibling services.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub port: Option<u16>,
    pub host: Option<String>,
    #[serde(alias = "interval")]
    pub storage_interval: Option<u64>,
    pub lag: Option<u64>,
    pub max_utilization_pct: Option<f64>,
    pub max_operator_utilization_pct: Option<f64>,
    pub default_page_size: Option<usize>,
    pub max_page_size: Option<usize>,
    pub fetch_page_size: Option<usize>,
    pub test_moray_data: Option<PathBuf>,
    pub database_url: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    /// Reads and parses a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Where refreshes read records from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// The storage bucket in `PostgreSQL`.
    Database { url: String },
    /// A JSON array of records, read once at startup.
    TestData { path: PathBuf },
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub database_url: Option<String>,
    pub test_data: Option<PathBuf>,
    /// Number of `-v` flags.
    pub verbosity: u8,
    pub log_format: LogFormat,
}

/// Everything the server needs to run.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub store: Option<StoreConfig>,
    pub log: LogConfig,
}

impl AppConfig {
    /// Loads `path` (if any), applies `overrides`, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        let config = Self::merge(file, overrides);
        config.validate()?;
        Ok(config)
    }

    /// Combines file values, CLI overrides and defaults without validating.
    #[must_use]
    pub fn merge(file: ConfigFile, overrides: &Overrides) -> Self {
        let cache_defaults = CacheConfig::default();
        let thresholds = Thresholds::default();
        let limits = PageLimits::default();

        let network = NetworkConfig {
            host: file.host.unwrap_or_else(|| NetworkConfig::default().host),
            port: overrides.port.or(file.port).unwrap_or(DEFAULT_PORT),
            ..NetworkConfig::default()
        };

        let cache = CacheConfig {
            refresh_interval: file
                .storage_interval
                .map_or(cache_defaults.refresh_interval, Duration::from_millis),
            lag: file.lag.map_or(cache_defaults.lag, Duration::from_millis),
            thresholds: Thresholds {
                utilization: file.max_utilization_pct.unwrap_or(thresholds.utilization),
                operator_utilization: file
                    .max_operator_utilization_pct
                    .unwrap_or(thresholds.operator_utilization),
            },
            fetch_page_size: file
                .fetch_page_size
                .unwrap_or(cache_defaults.fetch_page_size),
            page_limits: PageLimits {
                default_page_size: file.default_page_size.unwrap_or(limits.default_page_size),
                max_page_size: file.max_page_size.unwrap_or(limits.max_page_size),
            },
        };

        // A test dataset replaces the store entirely, wherever it came from.
        let test_data = overrides.test_data.clone().or(file.test_moray_data);
        let database_url = overrides.database_url.clone().or(file.database_url);
        let store = match (test_data, database_url) {
            (Some(path), _) => Some(StoreConfig::TestData { path }),
            (None, Some(url)) => Some(StoreConfig::Database { url }),
            (None, None) => None,
        };

        let level = match overrides.verbosity {
            0 => file.log_level.unwrap_or_else(|| LogConfig::default().level),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };

        Self {
            network,
            cache,
            store,
            log: LogConfig {
                level,
                format: overrides.log_format,
            },
        }
    }

    /// Checks ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = &self.cache.thresholds;
        for (name, value) in [
            ("maxUtilizationPct", thresholds.utilization),
            ("maxOperatorUtilizationPct", thresholds.operator_utilization),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Threshold { name, value });
            }
        }

        let limits = &self.cache.page_limits;
        check_page_size("maxPageSize", limits.max_page_size, usize::MAX)?;
        check_page_size("defaultPageSize", limits.default_page_size, usize::MAX)?;
        if limits.default_page_size > limits.max_page_size {
            return Err(ConfigError::DefaultAboveMax {
                default: limits.default_page_size,
                max: limits.max_page_size,
            });
        }
        check_page_size(
            "fetchPageSize",
            self.cache.fetch_page_size,
            MAX_FETCH_PAGE_SIZE,
        )?;

        if self.cache.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.store.is_none() {
            return Err(ConfigError::NoSource);
        }
        Ok(())
    }
}

fn check_page_size(name: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::PageSize { name, value, max });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Record feed construction
// ---------------------------------------------------------------------------

/// Opens the configured record source.
///
/// # Errors
///
/// Returns an error if the test dataset cannot be loaded or the database
/// cannot be reached.
pub async fn build_feed(store: &StoreConfig) -> anyhow::Result<RecordFeed> {
    match store {
        StoreConfig::TestData { path } => {
            info!(path = %path.display(), "using test storage node data");
            RecordFeed::from_json_file(path)
        }
        StoreConfig::Database { url } => connect_database(url).await,
    }
}

#[cfg(feature = "postgres")]
async fn connect_database(url: &str) -> anyhow::Result<RecordFeed> {
    use crate::store::postgres::{PostgresConfig, PostgresRecordSource};

    let source = PostgresRecordSource::connect(&PostgresConfig {
        url: url.to_string(),
        max_connections: 4,
    })
    .await?;
    Ok(RecordFeed::store(source))
}

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn connect_database(_url: &str) -> anyhow::Result<RecordFeed> {
    anyhow::bail!("databaseUrl is set but this build has no `postgres` feature; use testMorayData")
}
