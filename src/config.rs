//! JSON configuration loading.
//!
//! The config file is selected by the `--config_path` CLI flag. The
//! `source` and `destination` blocks are tagged unions discriminated by a
//! `type` string; unknown tags are rejected at load. Raw
//! [`WorkerConfiguration`] values are resolved into a validated
//! [`WorkerOptions`] before the pipeline starts.

use std::{path::Path, time::Duration};

use serde::Deserialize;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("source connection details are incomplete: {0} is required")]
    MissingConnectionDetail(&'static str),

    #[error("source port is not a valid port number: {0}")]
    InvalidPort(String),

    #[error("at least one schema must be specified")]
    NoSchemas,

    #[error("pool size must be greater than 0")]
    InvalidPool,

    #[error("no_of_workers must be greater than 0")]
    NoWorkers,

    #[error("invalid exclude regex {pattern:?} for schema {schema}: {source}")]
    InvalidExcludeRegex {
        schema: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: Source,
    pub destination: Destination,
    pub worker_configuration: WorkerConfiguration,
    /// Reserved block; parsed for presence only.
    #[serde(default)]
    pub tracking_configuration: Option<serde_json::Value>,
    #[serde(default)]
    pub stats_configuration: StatsConfiguration,
}

/// Source database, discriminated by the `type` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Source {
    Postgres(PostgresSource),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSource {
    pub connection_details: PostgresConnectionDetails,
    pub configuration: PostgresConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConnectionDetails {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub database: String,
}

impl PostgresConnectionDetails {
    /// Port parsed into a number, validated by [`Config::validate`].
    pub fn port_number(&self) -> Result<u16, ConfigError> {
        self.port
            .parse()
            .map_err(|_| ConfigError::InvalidPort(self.port.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfiguration {
    pub schemas: Vec<String>,
    #[serde(default)]
    pub excluded_schemas: Vec<String>,
    #[serde(default)]
    pub exclude_tables_list: Vec<ExcludeTables>,
    #[serde(default)]
    pub exclude_table_regex_list: Vec<ExcludeTableRegex>,
    pub pool: u32,
}

/// Exact table names excluded per schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ExcludeTables {
    pub schema: String,
    pub tables: Vec<String>,
}

/// Regex patterns excluding table names per schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ExcludeTableRegex {
    pub schema: String,
    pub regex: Vec<String>,
}

/// Destination database, discriminated by the `type` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Destination {
    Doris(DorisDestination),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DorisDestination {
    pub connection_details: DorisConnectionDetails,
    #[serde(default)]
    pub configuration: DorisConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DorisConnectionDetails {
    #[serde(default)]
    pub fe_nodes: String,
    #[serde(default)]
    pub fe_port: u16,
    pub be_nodes: String,
    pub be_port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DorisConfiguration {
    #[serde(default)]
    pub pool: u32,
}

/// Raw worker configuration as found in the config file.
///
/// Values ≤ 0 fall back to defaults when resolved by [`Self::resolve`];
/// `no_of_workers` has no default and must be positive.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfiguration {
    #[serde(default)]
    pub no_of_workers: i64,
    #[serde(default)]
    pub worker_batch_size: i64,
    #[serde(default)]
    pub id_batch_size: i64,
    #[serde(default)]
    pub concurrent_tables: i64,
    #[serde(default)]
    pub batch_processing_timeout_ms: i64,
    #[serde(default)]
    pub record_batch_size: i64,
}

const DEFAULT_WORKER_BATCH_SIZE: usize = 10_000;
const DEFAULT_ID_BATCH_SIZE: usize = 10_000;
const DEFAULT_CONCURRENT_TABLES: usize = 10;
const DEFAULT_BATCH_PROCESSING_TIMEOUT_MS: u64 = 500;
const DEFAULT_RECORD_BATCH_SIZE: usize = 5_000;

impl WorkerConfiguration {
    /// Apply defaults and produce validated pipeline options.
    pub fn resolve(&self) -> Result<WorkerOptions, ConfigError> {
        if self.no_of_workers <= 0 {
            return Err(ConfigError::NoWorkers);
        }

        fn or_default(value: i64, default: usize) -> usize {
            if value <= 0 { default } else { value as usize }
        }

        Ok(WorkerOptions {
            no_of_workers: self.no_of_workers as usize,
            worker_batch_size: or_default(self.worker_batch_size, DEFAULT_WORKER_BATCH_SIZE),
            id_batch_size: or_default(self.id_batch_size, DEFAULT_ID_BATCH_SIZE),
            concurrent_tables: or_default(self.concurrent_tables, DEFAULT_CONCURRENT_TABLES),
            batch_processing_timeout: Duration::from_millis(
                if self.batch_processing_timeout_ms <= 0 {
                    DEFAULT_BATCH_PROCESSING_TIMEOUT_MS
                } else {
                    self.batch_processing_timeout_ms as u64
                },
            ),
            record_batch_size: or_default(self.record_batch_size, DEFAULT_RECORD_BATCH_SIZE),
        })
    }
}

/// Validated worker options consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Stage B worker count per table; also sizes the source pool.
    pub no_of_workers: usize,
    /// Records queue capacity; Stage A slices pages into ranges of this size.
    pub worker_batch_size: usize,
    /// Ranges queue capacity; page size for primary key scans.
    pub id_batch_size: usize,
    /// Admission concurrency across tables.
    pub concurrent_tables: usize,
    /// Stage C idle-flush timeout.
    pub batch_processing_timeout: Duration,
    /// Stage C batch size and flush trigger.
    pub record_batch_size: usize,
}

/// Periodic process-metrics sampler settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsConfiguration {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_seconds: i64,
    #[serde(default)]
    pub output_file: String,
}

const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

impl StatsConfiguration {
    pub fn interval(&self) -> Duration {
        if self.interval_seconds <= 0 {
            Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS)
        } else {
            Duration::from_secs(self.interval_seconds as u64)
        }
    }
}

/// Load and validate the configuration from a JSON file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let Source::Postgres(pg) = &self.source;

        let details = &pg.connection_details;
        if details.host.is_empty() {
            return Err(ConfigError::MissingConnectionDetail("host"));
        }
        if details.port.is_empty() {
            return Err(ConfigError::MissingConnectionDetail("port"));
        }
        if details.database.is_empty() {
            return Err(ConfigError::MissingConnectionDetail("database"));
        }
        details.port_number()?;

        if pg.configuration.schemas.is_empty() {
            return Err(ConfigError::NoSchemas);
        }
        if pg.configuration.pool == 0 {
            return Err(ConfigError::InvalidPool);
        }

        // Catch bad exclude regexes at startup rather than mid-run.
        for entry in &pg.configuration.exclude_table_regex_list {
            for pattern in &entry.regex {
                regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidExcludeRegex {
                    schema: entry.schema.clone(),
                    pattern: pattern.clone(),
                    source,
                })?;
            }
        }

        self.worker_configuration.resolve()?;

        Ok(())
    }
}
