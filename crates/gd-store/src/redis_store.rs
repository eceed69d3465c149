//! Redis backend. One multiplexed connection shared by all callers;
//! compound updates that must be atomic go through Lua scripts.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tracing::debug;

use crate::{CoordinationStore, StoreError};

/// INCR that sets the window TTL only when the key is created, so the
/// window never slides on subsequent increments.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

pub struct RedisStore {
    con: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let con = client.get_multiplexed_async_connection().await?;
        debug!(url, "connected to redis coordination store");
        Ok(Self { con })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut con = self.con.clone();
        let count: u64 = Script::new(INCR_WINDOW_SCRIPT)
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<u64, StoreError> {
        let mut con = self.con.clone();
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value.unwrap_or(0))
    }

    async fn window_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut con = self.con.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut con).await?;
        // -2 = missing key, -1 = no expiry
        if pttl < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(pttl as u64)))
    }

    async fn hash_incr(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut con = self.con.clone();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let _: i64 = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut con = self.con.clone();
        let all: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut con).await?;
        Ok(all)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut con = self.con.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut con = self.con.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(std::process::id())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key).await
    }
}
