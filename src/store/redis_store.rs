#![forbid(unsafe_code)]

// Redis-backed store. Each key is a hash {version, data}; conditional writes run as Lua scripts.

use super::{KeyValueStore, StoreError, StoreResult, Versioned};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

const CAS_SCRIPT: &str = r#"
local current = redis.call("HGET", KEYS[1], "version")
if current == false then current = "0" end
if current ~= ARGV[1] then
    return 0
end
redis.call("HSET", KEYS[1], "version", ARGV[2], "data", ARGV[3])
return 1
"#;

const CAS_DELETE_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], "version") == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// `KeyValueStore` shared by every gateway process through one Redis instance
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
    cas_delete: Script,
}

impl RedisStore {
    /// Connects to Redis at `url`
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        info!("Connected to Redis room store");

        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
            cas_delete: Script::new(CAS_DELETE_SCRIPT),
        })
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        let mut conn = self.conn.clone();
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("version")
            .arg("data")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        match (version, data) {
            (Some(version), Some(value)) => Ok(Some(Versioned { version, value })),
            (None, None) => Ok(None),
            _ => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "hash is missing its version or data field".to_string(),
            }),
        }
    }

    async fn compare_and_swap(&self, key: &str, expected_version: u64, value: String) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(key)
            .arg(expected_version)
            .arg(expected_version + 1)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;

        if swapped == 0 {
            debug!(key = %key, expected_version, "CAS rejected: version moved");
        }
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected_version: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i32 = self
            .cas_delete
            .key(key)
            .arg(expected_version)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
