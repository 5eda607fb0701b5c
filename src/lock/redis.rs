use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use super::{LockRecord, LockStore};
use crate::{Result, VaultError};

/// Redis connection settings for the lock store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisLockConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix for every lock key
    pub key_prefix: String,
}

impl Default for RedisLockConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            key_prefix: "configvault:".to_string(),
        }
    }
}

// KEYS[1] lock key
// ARGV[1] expected lease id ("" = key must be absent)
// ARGV[2] new record JSON ("" = delete)
// ARGV[3] ttl in milliseconds for the new record
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
local current_lease = ''
if current then
    current_lease = cjson.decode(current)['lease_id']
end
if current_lease ~= ARGV[1] then
    return 0
end
if ARGV[2] == '' then
    redis.call('DEL', KEYS[1])
else
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
"#;

/// Lock store backed by Redis; compare-and-set runs as one Lua script
#[derive(Clone)]
pub struct RedisLockStore {
    connection: ConnectionManager,
    config: RedisLockConfig,
    script: Script,
}

impl RedisLockStore {
    /// Connect to Redis
    pub async fn new(config: RedisLockConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| VaultError::Validation(format!("invalid redis url: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| VaultError::unavailable("redis", e))?;

        Ok(Self {
            connection,
            config,
            script: Script::new(COMPARE_AND_SET),
        })
    }

    fn lock_key(&self, environment: &str) -> String {
        format!("{}lock:{}", self.config.key_prefix, environment)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn get(&self, environment: &str) -> Result<Option<LockRecord>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(self.lock_key(environment))
            .await
            .map_err(|e| VaultError::unavailable("redis", e))?;

        raw.map(|json| serde_json::from_str(&json).map_err(VaultError::from))
            .transpose()
    }

    #[instrument(skip(self, new))]
    async fn compare_and_set(
        &self,
        environment: &str,
        expected_lease: Option<Uuid>,
        new: Option<&LockRecord>,
    ) -> Result<bool> {
        let expected = expected_lease.map(|id| id.to_string()).unwrap_or_default();
        let (payload, ttl_ms) = match new {
            Some(record) => {
                let ttl = (record.lease_expiry - chrono::Utc::now()).num_milliseconds().max(1);
                (serde_json::to_string(record)?, ttl)
            }
            None => (String::new(), 0),
        };

        let mut conn = self.connection.clone();
        let swapped: i32 = self
            .script
            .key(self.lock_key(environment))
            .arg(expected)
            .arg(payload)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| VaultError::unavailable("redis", e))?;

        Ok(swapped == 1)
    }
}
