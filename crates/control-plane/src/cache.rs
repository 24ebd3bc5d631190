use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::policy::EffectivePolicySet;

/// Memoises resolved policy sets. Readers tolerate entries stale up to
/// the TTL; admin-surface writes call `invalidate` with the affected key.
pub trait PolicyCache: Send + Sync {
    fn get(&self, key: &str) -> Option<EffectivePolicySet>;
    fn put(&self, key: &str, set: &EffectivePolicySet, ttl_seconds: u64);
    fn invalidate(&self, key: &str);
}

struct CacheEntry {
    expires_at_ms: i64,
    set: EffectivePolicySet,
}

#[derive(Default)]
pub struct InMemoryPolicyCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryPolicyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

impl PolicyCache for InMemoryPolicyCache {
    fn get(&self, key: &str) -> Option<EffectivePolicySet> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at_ms > Self::now_ms() => Some(entry.set.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, set: &EffectivePolicySet, ttl_seconds: u64) {
        let expires_at_ms = Self::now_ms() + (ttl_seconds.max(1) as i64) * 1000;
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                expires_at_ms,
                set: set.clone(),
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
