//! Trading Token Lookup
//!
//! Session tokens are minted elsewhere and pushed into the shared cache
//! under `trading:<token>`; this store resolves them to user ids.

use crate::cache::RedisClient;
use redis::RedisError;
use std::sync::Arc;

const TRADING_TOKEN_PREFIX: &str = "trading:";

pub struct TokenStore {
    client: Arc<RedisClient>,
}

impl TokenStore {
    pub fn new(client: Arc<RedisClient>) -> Self {
        Self { client }
    }

    /// Resolve a token to its user id; `None` means unknown or expired.
    pub async fn lookup(&self, token: &str) -> Result<Option<String>, RedisError> {
        let key = format!("{TRADING_TOKEN_PREFIX}{token}");
        self.client.get(&key).await
    }

    pub async fn is_available(&self) -> bool {
        self.client.is_available().await
    }
}
