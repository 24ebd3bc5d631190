use redis::{Commands, Script};

use crate::cache::PolicyCache;
use crate::policy::EffectivePolicySet;
use crate::rate_counter::{CounterError, RateCounterStore};

#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "warden".to_string(),
        }
    }
}

/// Policy cache on Redis. Absence of the cache is never a blocker, so
/// reads swallow connection errors and report a miss.
#[derive(Clone)]
pub struct RedisPolicyCache {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisPolicyCache {
    pub fn new(client: redis::Client, config: RedisStoreConfig) -> Self {
        Self { client, config }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }
}

impl PolicyCache for RedisPolicyCache {
    fn get(&self, key: &str) -> Option<EffectivePolicySet> {
        let mut conn = self.client.get_connection().ok()?;
        let payload: Option<String> = conn.get(self.cache_key(key)).ok()?;
        serde_json::from_str(&payload?).ok()
    }

    fn put(&self, key: &str, set: &EffectivePolicySet, ttl_seconds: u64) {
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let payload = match serde_json::to_string(set) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let _: Result<(), _> = redis::cmd("SETEX")
            .arg(self.cache_key(key))
            .arg(ttl_seconds.max(1))
            .arg(payload)
            .query(&mut conn);
    }

    fn invalidate(&self, key: &str) {
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let _: Result<i32, _> = redis::cmd("DEL").arg(self.cache_key(key)).query(&mut conn);
    }
}

/// Window counters on Redis. The increment and the TTL run in one script
/// invocation so the pair is atomic on the server.
#[derive(Clone)]
pub struct RedisRateCounterStore {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisRateCounterStore {
    pub fn new(client: redis::Client, config: RedisStoreConfig) -> Self {
        Self { client, config }
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }
}

impl RateCounterStore for RedisRateCounterStore {
    fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, CounterError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        let script = Script::new(
            r#"
            local count = redis.call("INCR", KEYS[1])
            if count == 1 then
                redis.call("EXPIRE", KEYS[1], tonumber(ARGV[1]))
            end
            return count
        "#,
        );
        let count: i64 = script
            .key(self.counter_key(key))
            .arg(ttl_seconds.max(1) as i64)
            .invoke(&mut conn)
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        Ok(count.max(0) as u64)
    }

    fn current(&self, key: &str) -> Result<u64, CounterError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        let count: Option<i64> = conn
            .get(self.counter_key(key))
            .map_err(|err| CounterError::Unavailable(err.to_string()))?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }
}

fn _assert_send_sync<T: Send + Sync>() {}

#[allow(dead_code)]
fn _assert_redis_types() {
    _assert_send_sync::<RedisPolicyCache>();
    _assert_send_sync::<RedisRateCounterStore>();
}
