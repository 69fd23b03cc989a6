//! Application Configuration
//!
//! Everything comes from `AUREX_*` environment variables (optionally via a
//! `.env` file). The database DSN is the only mandatory input; the rest
//! default to a sensible single-host development setup.

use ::config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres DSN. Required; startup fails without it.
    pub db_dsn: String,

    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default = "default_tcp_address")]
    pub tcp_address: String,

    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Prometheus scrape endpoint.
    #[serde(default = "default_metrics_address")]
    pub metrics_address: String,

    #[serde(default)]
    pub dev_verbose: bool,

    /// Opening balance for newly created accounts, in dollars.
    #[serde(default = "default_initial_cash_dollars")]
    pub initial_cash_dollars: f64,

    /// Seconds between dirty-account flushes to the database.
    #[serde(default = "default_account_flush_secs")]
    pub account_flush_secs: u64,

    /// Events per persistence transaction.
    #[serde(default = "default_persist_batch_size")]
    pub persist_batch_size: usize,

    /// Minutes before an idle session is pruned.
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: u64,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_tcp_address() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    50052
}

fn default_metrics_address() -> String {
    "0.0.0.0:9184".to_string()
}

fn default_initial_cash_dollars() -> f64 {
    100_000.0
}

fn default_account_flush_secs() -> u64 {
    30
}

fn default_persist_batch_size() -> usize {
    100
}

fn default_session_idle_minutes() -> u64 {
    30
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("AUREX").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    pub fn tcp_bind(&self) -> String {
        format!("{}:{}", self.tcp_address, self.tcp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_environment() {
        std::env::set_var("AUREX_DB_DSN", "postgres://localhost/aurex_test");
        std::env::set_var("AUREX_TCP_PORT", "40052");

        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.db_dsn, "postgres://localhost/aurex_test");
        assert_eq!(config.tcp_port, 40052);
        // Defaults fill the rest.
        assert_eq!(config.redis_host, "localhost");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.tcp_bind(), "0.0.0.0:40052");
        assert_eq!(config.redis_url(), "redis://localhost:6379");

        std::env::remove_var("AUREX_DB_DSN");
        std::env::remove_var("AUREX_TCP_PORT");
    }
}
