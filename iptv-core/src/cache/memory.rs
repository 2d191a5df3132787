use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{system_clock, SharedClock};

use super::{CacheError, CacheResult, FastCache};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<String>>,
}

/// In-process cache with TTL semantics matching the redis backend.
#[derive(Debug)]
pub struct MemoryCache {
    state: Mutex<State>,
    clock: SharedClock,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired = match state.values.get(key) {
            Some(entry) => entry.expires_at.map(|at| at <= now).unwrap_or(false),
            None => return Ok(None),
        };
        if expired {
            state.values.remove(key);
            return Ok(None);
        }
        Ok(state.values.get(key).map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| CacheError::Unavailable(format!("ttl out of range: {err}")))?;
        let expires_at = self.clock.now() + ttl;
        self.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        let now = self.clock.now();
        let mut state = self.lock();
        let entry = state.values.entry(key.to_string()).or_insert(Entry {
            value: "0".into(),
            expires_at: None,
        });
        if entry.expires_at.map(|at| at <= now).unwrap_or(false) {
            entry.value = "0".into();
            entry.expires_at = None;
        }
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| CacheError::InvalidValue {
                key: key.to_string(),
                value: entry.value.clone(),
            })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn push_job(&self, queue: &str, payload: &str) -> CacheResult<()> {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop_job(&self, queue: &str) -> CacheResult<Option<String>> {
        Ok(self
            .lock()
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }
}
