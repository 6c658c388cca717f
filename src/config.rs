//! Configuration management for the tempo sync server and client

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Settings for the client side of the protocol
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote store
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    pub max_attempts: usize,
    pub device_id: String,
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            timeout: self.timeout(),
            ..RetryPolicy::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./tempo.db".to_string(),
            },
            sync: SyncConfig {
                base_url: "http://localhost:3000".to_string(),
                timeout_ms: 10_000,
                max_attempts: 3,
                device_id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            sync: SyncConfig {
                base_url: env::var("SYNC_BASE_URL").unwrap_or(defaults.sync.base_url),
                timeout_ms: parse_var("SYNC_TIMEOUT_MS", defaults.sync.timeout_ms)?,
                max_attempts: parse_var("SYNC_MAX_ATTEMPTS", defaults.sync.max_attempts)?,
                device_id: env::var("SYNC_DEVICE_ID").unwrap_or(defaults.sync.device_id),
            },
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
