use anyhow::{anyhow, Context, Result};
use std::env;

use crate::payments::providers::mpesa::MpesaConfig;
use crate::payments::reconciler::SweeperConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// `None` runs on the in-memory store (development only)
    pub database: Option<DatabaseConfig>,
    /// `None` keeps the access token in-process only
    pub redis: Option<RedisConfig>,
    pub mpesa: MpesaConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        };

        let database = match non_empty_var("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
            }),
            None => None,
        };

        let redis = non_empty_var("REDIS_URL").map(|url| RedisConfig { url });

        let mpesa = MpesaConfig::from_env().context("Invalid M-Pesa configuration")?;

        let config = Config {
            server,
            database,
            redis,
            mpesa,
            sweeper: SweeperConfig::from_env().context("Invalid sweeper configuration")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        match &self.database {
            Some(database) if database.max_connections == 0 => {
                return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
            }
            None if self.server.environment != "development" => {
                return Err(anyhow!(
                    "DATABASE_URL is required outside development; payment records must be durable"
                ));
            }
            _ => {}
        }

        self.mpesa.validate().context("Invalid M-Pesa configuration")?;

        Ok(())
    }
}
