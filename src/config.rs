//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub twitter: TwitterConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Twitter API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TwitterConfig {
    /// API base URL (overridable for tests/proxies)
    pub base_url: String,
    /// OAuth2 bearer token
    pub bearer_token: String,
    /// Records per relation page; the remote maximum is 1000
    pub page_size: u32,
}

/// Cache freshness configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Age after which a cached edge set is stale (default: 36000 = 10h)
    pub relation_max_age_seconds: u64,
}

impl CacheConfig {
    pub fn relation_max_age(&self) -> Duration {
        Duration::from_secs(self.relation_max_age_seconds)
    }
}

/// Job queue / scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Promotion-loop poll interval (default: 2000ms)
    pub poll_interval_ms: u64,
    /// Safety margin added to remote rate-limit reset times (default: 2000ms)
    pub rate_limit_buffer_ms: u64,
    /// Maximum concurrently executing jobs
    pub max_concurrency: usize,
    /// Bounded retries for non-rate-limit errors before a job fails
    pub max_attempts: i64,
    /// Delay between generic retries
    pub retry_delay_ms: u64,
    /// Remote mutations performed per job invocation
    pub mutation_chunk_size: usize,
    /// Completed-job retention: age cap (default: 1h)
    pub completed_retention_seconds: u64,
    /// Completed-job retention: count cap (default: 100)
    pub completed_retention_count: i64,
    /// Failed-job retention: age cap (default: 48h)
    pub failed_retention_seconds: u64,
    /// Failed-job retention: count cap (default: 1000)
    pub failed_retention_count: i64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rate_limit_buffer(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.rate_limit_buffer_ms as i64)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.retry_delay_ms as i64)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (ROOST_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "data/roost.db")?
            .set_default("twitter.base_url", "https://api.twitter.com")?
            .set_default("twitter.page_size", 1000)?
            .set_default("cache.relation_max_age_seconds", 36_000)?
            .set_default("queue.poll_interval_ms", 2000)?
            .set_default("queue.rate_limit_buffer_ms", 2000)?
            .set_default("queue.max_concurrency", 4)?
            .set_default("queue.max_attempts", 3)?
            .set_default("queue.retry_delay_ms", 5000)?
            .set_default("queue.mutation_chunk_size", 2)?
            .set_default("queue.completed_retention_seconds", 3600)?
            .set_default("queue.completed_retention_count", 100)?
            .set_default("queue.failed_retention_seconds", 172_800)?
            .set_default("queue.failed_retention_count", 1000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (ROOST_*)
            .add_source(
                Environment::with_prefix("ROOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.twitter.bearer_token.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "twitter.bearer_token must be set".to_string(),
            ));
        }

        if self.twitter.page_size == 0 || self.twitter.page_size > 1000 {
            return Err(crate::error::AppError::Config(
                "twitter.page_size must be between 1 and 1000".to_string(),
            ));
        }

        if self.queue.max_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "queue.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.queue.mutation_chunk_size == 0 {
            return Err(crate::error::AppError::Config(
                "queue.mutation_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.queue.poll_interval_ms == 0 {
            return Err(crate::error::AppError::Config(
                "queue.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
