//! Configuration loading for the sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SAPSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SAPSYNC_";

/// Application configuration derived from `SAPSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub odata: ODataConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Output format shared by the console subscriber and the error file sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One compact JSON object per line.
    Json,
    /// Human-readable, aligned key/value output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "human" | "text" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::InvalidLogFormat {
                value: other.to_string(),
            }),
        }
    }
}

/// Error-reporting knobs: clipping, dedup and the optional file sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Suppress repeated error fingerprints from the file sink.
    #[serde(default = "default_true")]
    pub dedup: bool,
    /// Seconds a fingerprint stays suppressed; `0` suppresses for the process lifetime.
    #[serde(default)]
    pub dedup_ttl_seconds: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    #[serde(default = "default_max_stack")]
    pub max_stack: usize,
    #[serde(default = "default_max_body")]
    pub max_body: usize,
    #[serde(default = "default_max_sql")]
    pub max_sql: usize,
    #[serde(default = "default_max_row")]
    pub max_row: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_path: Option<PathBuf>,
    /// Append a timestamp and pid to the error log file name.
    #[serde(default)]
    pub error_log_roll: bool,
}

/// OData endpoint credentials and HTTP behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ODataConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_odata_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_odata_retries")]
    pub retries: u32,
    #[serde(default = "default_odata_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Log full request and response payloads.
    #[serde(default)]
    pub debug: bool,
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the individual parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub name: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Engine-wide defaults for jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub null_if_empty: bool,
    #[serde(default)]
    pub trim_strings: bool,
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Trigger every enabled job once when the scheduler starts.
    #[serde(default = "default_true")]
    pub run_on_boot: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            logging: LoggingConfig::default(),
            odata: ODataConfig::default(),
            database: DatabaseConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            dedup: true,
            dedup_ttl_seconds: 0,
            dedup_max_entries: default_dedup_max_entries(),
            max_stack: default_max_stack(),
            max_body: default_max_body(),
            max_sql: default_max_sql(),
            max_row: default_max_row(),
            error_log_path: None,
            error_log_roll: false,
        }
    }
}

impl Default for ODataConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            timeout_ms: default_odata_timeout_ms(),
            retries: default_odata_retries(),
            retry_base_ms: default_odata_retry_base_ms(),
            debug: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_pg_host(),
            port: default_pg_port(),
            name: default_pg_database(),
            user: default_pg_user(),
            password: String::new(),
            ssl: false,
            max_connections: default_db_max_connections(),
            acquire_timeout_ms: default_db_acquire_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            batch_size: default_batch_size(),
            null_if_empty: true,
            trim_strings: false,
            jobs_dir: default_jobs_dir(),
            state_dir: default_state_dir(),
            run_on_boot: true,
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.odata.password.is_empty() {
            config.odata.password = "[REDACTED]".to_string();
        }
        if !config.database.password.is_empty() {
            config.database.password = "[REDACTED]".to_string();
        }
        if config.database.url.is_some() {
            config.database.url = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error on out-of-range settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;

        if self.odata.timeout_ms < 1_000 || self.odata.timeout_ms > 600_000 {
            return Err(ConfigError::InvalidODataTimeout {
                value: self.odata.timeout_ms,
            });
        }

        if self.odata.retries > 10 {
            return Err(ConfigError::InvalidODataRetries {
                value: self.odata.retries,
            });
        }

        if self.odata.password.is_empty() != self.odata.user.is_empty() {
            return Err(ConfigError::IncompleteODataCredentials);
        }

        if self.database.url.is_none() && self.database.port == 0 {
            return Err(ConfigError::InvalidDatabasePort);
        }

        if self.logging.dedup && self.logging.dedup_max_entries == 0 {
            return Err(ConfigError::InvalidDedupCapacity);
        }

        Ok(())
    }
}

impl SyncConfig {
    /// Validate page/batch bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > 100_000 {
            return Err(ConfigError::InvalidPageSize {
                value: self.page_size,
            });
        }

        if self.batch_size == 0 || self.batch_size > 10_000 {
            return Err(ConfigError::InvalidBatchSize {
                value: self.batch_size,
            });
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_max_stack() -> usize {
    4_000
}

fn default_max_body() -> usize {
    2_000
}

fn default_max_sql() -> usize {
    1_000
}

fn default_max_row() -> usize {
    2_000
}

fn default_odata_timeout_ms() -> u64 {
    30_000
}

fn default_odata_retries() -> u32 {
    3
}

fn default_odata_retry_base_ms() -> u64 {
    500
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_database() -> String {
    "postgres".to_string()
}

fn default_pg_user() -> String {
    "postgres".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_page_size() -> u32 {
    1_000
}

fn default_batch_size() -> usize {
    500
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".state")
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid log format '{value}'; expected json or pretty")]
    InvalidLogFormat { value: String },
    #[error("page size must be between 1 and 100000, got {value}")]
    InvalidPageSize { value: u32 },
    #[error("batch size must be between 1 and 10000, got {value}")]
    InvalidBatchSize { value: usize },
    #[error("OData timeout must be between 1000 and 600000 ms, got {value}")]
    InvalidODataTimeout { value: u64 },
    #[error("OData retries must be at most 10, got {value}")]
    InvalidODataRetries { value: u32 },
    #[error("OData credentials are incomplete; set both SAPSYNC_ODATA_USER and SAPSYNC_ODATA_PASSWORD")]
    IncompleteODataCredentials,
    #[error("database port must be non-zero")]
    InvalidDatabasePort,
    #[error("log dedup is enabled but SAPSYNC_LOG_DEDUP_MAX_ENTRIES is 0")]
    InvalidDedupCapacity,
}

/// Parse the usual boolean spellings found in env files.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Loads configuration using layered `.env` files and `SAPSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut take = |key: &str| layered.remove(key).filter(|v| !v.trim().is_empty());

        let profile = take("PROFILE").unwrap_or(profile_hint);
        let log_level = take("LOG_LEVEL").unwrap_or_else(default_log_level);
        let format = match take("LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => default_log_format(),
        };

        let logging = LoggingConfig {
            format,
            dedup: take("LOG_DEDUP")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            dedup_ttl_seconds: take("LOG_DEDUP_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            dedup_max_entries: take("LOG_DEDUP_MAX_ENTRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_dedup_max_entries),
            max_stack: take("LOG_MAX_STACK")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_stack),
            max_body: take("LOG_MAX_BODY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_body),
            max_sql: take("LOG_MAX_SQL")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_sql),
            max_row: take("LOG_MAX_ROW")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_row),
            error_log_path: take("ERROR_LOG_PATH").map(PathBuf::from),
            error_log_roll: take("ERROR_LOG_ROLL")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
        };

        let odata = ODataConfig {
            user: take("ODATA_USER").unwrap_or_default(),
            password: take("ODATA_PASSWORD").unwrap_or_default(),
            timeout_ms: take("ODATA_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_odata_timeout_ms),
            retries: take("ODATA_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_odata_retries),
            retry_base_ms: take("ODATA_RETRY_BASE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_odata_retry_base_ms),
            debug: take("ODATA_DEBUG")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
        };

        let database = DatabaseConfig {
            url: take("DATABASE_URL"),
            host: take("PG_HOST").unwrap_or_else(default_pg_host),
            port: take("PG_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pg_port),
            name: take("PG_DATABASE").unwrap_or_else(default_pg_database),
            user: take("PG_USER").unwrap_or_else(default_pg_user),
            password: take("PG_PASSWORD").unwrap_or_default(),
            ssl: take("PG_SSL")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            max_connections: take("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_db_max_connections),
            acquire_timeout_ms: take("DB_ACQUIRE_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_db_acquire_timeout_ms),
        };

        let sync = SyncConfig {
            page_size: take("PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_page_size),
            batch_size: take("BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_batch_size),
            null_if_empty: take("NULL_IF_EMPTY")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            trim_strings: take("TRIM_STRINGS")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            jobs_dir: take("JOBS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_jobs_dir),
            state_dir: take("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
            run_on_boot: take("RUN_ON_BOOT")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
        };

        let config = AppConfig {
            profile,
            log_level,
            logging,
            odata,
            database,
            sync,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
