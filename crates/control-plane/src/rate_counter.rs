use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Shared window counters. `increment` must apply the count and the TTL
/// atomically so a crash between the two cannot leak an un-expiring key.
pub trait RateCounterStore: Send + Sync {
    fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, CounterError>;
    fn current(&self, key: &str) -> Result<u64, CounterError>;
}

struct CounterState {
    expires_at_ms: i64,
    count: u64,
}

/// Process-local counters for tests and single-node deployments. The
/// `unavailable` switch simulates a store outage for fail-mode tests.
#[derive(Default)]
pub struct InMemoryRateCounterStore {
    state: Mutex<HashMap<String, CounterState>>,
    unavailable: AtomicBool,
}

impl InMemoryRateCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn check_available(&self) -> Result<(), CounterError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CounterError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

impl RateCounterStore for InMemoryRateCounterStore {
    fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, CounterError> {
        self.check_available()?;
        let now = Self::now_ms();
        let mut state = self.state.lock();
        let entry = state.entry(key.to_string()).or_insert(CounterState {
            expires_at_ms: now + (ttl_seconds.max(1) as i64) * 1000,
            count: 0,
        });
        if entry.expires_at_ms <= now {
            entry.expires_at_ms = now + (ttl_seconds.max(1) as i64) * 1000;
            entry.count = 0;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    fn current(&self, key: &str) -> Result<u64, CounterError> {
        self.check_available()?;
        let now = Self::now_ms();
        let state = self.state.lock();
        Ok(state
            .get(key)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.count)
            .unwrap_or(0))
    }
}
