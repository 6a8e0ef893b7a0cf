//! In-memory broker implementation for testing.
//!
//! Provides [`InMemoryBroker`], a thread-safe implementation of the
//! [`Broker`] trait backed by process-local maps.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process state
//! - **Single-process only**: queues are not shared across process boundaries

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Broker, BrokerError};

/// Converts a lock poison error to a broker error.
fn poison_err<T>(_: PoisonError<T>) -> BrokerError {
    BrokerError::Backend("lock poisoned".to_string())
}

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    values: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
}

impl Inner {
    /// Drops the key if its TTL has elapsed. Expiry is checked lazily on
    /// access, which is indistinguishable from eager expiry to callers.
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.lists.remove(key);
                self.hashes.remove(key);
                self.values.remove(key);
            }
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.lists.remove(key);
        self.hashes.remove(key);
        self.values.remove(key);
        self.expiries.remove(key);
    }
}

/// In-memory broker for tests.
#[derive(Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
}

impl InMemoryBroker {
    /// Creates an empty in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn append(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(queue);
        inner
            .lists
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop_head(&self, queue: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(queue);
        Ok(inner
            .lists
            .get_mut(queue)
            .and_then(|list| list.pop_front()))
    }

    async fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(queue);
        Ok(inner.lists.get(queue).map_or(0, VecDeque::len))
    }

    async fn clear(&self, queue: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.remove_key(queue);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(key);
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_len(&self, key: &str) -> Result<usize, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).map_or(0, HashMap::len))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.remove_key(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(key);

        let exists = inner.lists.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.values.contains_key(key);
        if exists {
            inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        }

        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.values.insert(key.to_string(), value.to_string());
        inner.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.purge_expired(key);
        Ok(inner.values.get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            inner.purge_expired(key);
            values.push(inner.values.get(key).cloned());
        }
        Ok(values)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;

        let all: Vec<String> = inner
            .lists
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.values.keys())
            .cloned()
            .collect();

        let mut matched = Vec::new();
        for key in all {
            inner.purge_expired(&key);
            let still_present = inner.lists.contains_key(&key)
                || inner.hashes.contains_key(&key)
                || inner.values.contains_key(&key);
            if still_present && glob_match(pattern, &key) && !matched.contains(&key) {
                matched.push(key);
            }
        }

        Ok(matched)
    }
}

/// Matches a key against a glob pattern where `*` stands for any substring.
fn glob_match(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;

    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return part.is_empty() || rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }

    true
}
