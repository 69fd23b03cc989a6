//! Redis Connection Management
//!
//! Small wrapper over the driver's `ConnectionManager`, which already
//! re-establishes a dropped connection on its own. All that is layered on
//! top is a bounded exponential-backoff retry so a blip does not surface
//! as an immediate failure, plus the handful of commands the exchange
//! actually issues (token lookups, pub/sub fan-out, health pings).

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::future::Future;
use std::time::Duration;

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,
    /// Attempts per command before the error is returned to the caller
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt
    pub retry_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

impl RedisConfig {
    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self {
            url: format!("redis://{host}:{port}"),
            ..Default::default()
        }
    }
}

/// Redis client with bounded command retries.
pub struct RedisClient {
    config: RedisConfig,
    manager: ConnectionManager,
}

impl RedisClient {
    /// Connect eagerly so startup surfaces a bad address immediately.
    pub async fn new(config: RedisConfig) -> Result<Self, RedisError> {
        let client = Client::open(config.url.as_str())?;
        tracing::info!(url = %config.url, "connecting to Redis");
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { config, manager })
    }

    /// Run one command, retrying with doubling backoff while the manager
    /// re-establishes the connection underneath.
    async fn retry<T, F, Fut>(&self, command: &'static str, mut op: F) -> Result<T, RedisError>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.config.max_retries => {
                    let backoff =
                        Duration::from_millis(self.config.retry_delay_ms << attempt.min(8));
                    attempt += 1;
                    tracing::warn!(
                        command,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "redis command failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::warn!(command, error = %e, "redis command failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    /// GET operation
    pub async fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.retry("GET", |mut conn| {
            let key = key.to_string();
            async move { conn.get(&key).await }
        })
        .await
    }

    /// PUBLISH operation (pub/sub fan-out to external consumers)
    pub async fn publish(&self, channel: &str, message: &str) -> Result<i32, RedisError> {
        self.retry("PUBLISH", |mut conn| {
            let channel = channel.to_string();
            let message = message.to_string();
            async move { conn.publish(&channel, &message).await }
        })
        .await
    }

    /// PING operation (health check)
    pub async fn ping(&self) -> Result<bool, RedisError> {
        self.retry("PING", |mut conn| async move {
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(reply == "PONG")
        })
        .await
    }

    pub async fn is_available(&self) -> bool {
        self.ping().await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_redis_config_from_host_port() {
        let config = RedisConfig::from_host_port("cache.internal", 6380);
        assert_eq!(config.url, "redis://cache.internal:6380");
    }
}
