// Configuration for the SQL gateway

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Full connection URL; overrides the individual fields when set.
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            url: None,
        }
    }
}

impl DatabaseConfig {
    /// Target description safe to log (no credentials).
    pub fn describe(&self) -> String {
        match &self.url {
            Some(_) => "<database url>".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.name),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub command_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            command_timeout_secs: 30,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

impl PoolConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
}

impl GatewayConfig {
    /// Layer defaults, an optional config file and `SQLGATE__SECTION__KEY`
    /// environment variables, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&GatewayConfig::default())
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SQLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(Error::Configuration(
                "max_connections must be > 0".to_string(),
            ));
        }
        if pool.min_connections > pool.max_connections {
            return Err(Error::Configuration(
                "min_connections cannot be greater than max_connections".to_string(),
            ));
        }
        if pool.command_timeout_secs == 0 || pool.acquire_timeout_secs == 0 {
            return Err(Error::Configuration(
                "pool timeouts must be > 0".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(Error::Configuration("server.port must be > 0".to_string()));
        }
        if self.database.url.is_none() {
            if self.database.host.is_empty() || self.database.name.is_empty() {
                return Err(Error::Configuration(
                    "database.host and database.name are required".to_string(),
                ));
            }
            if self.database.port == 0 {
                return Err(Error::Configuration("database.port must be > 0".to_string()));
            }
        }
        Ok(())
    }
}
