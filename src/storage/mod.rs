//! In-memory keyspace with expiration.
//!
//! Provides a single-owner key-value store with:
//! - String and stream values
//! - Absolute expiry times in epoch milliseconds
//! - Passive expiry on access and an active sweep driven by the event loop
//! - Glob matching over live keys
//!
//! The keyspace is owned by the dispatcher, which is owned by the one event
//! loop thread, so nothing here locks. Every operation takes `now` explicitly.

pub mod glob;
pub mod stream;

use bytes::Bytes;
use glob::{Glob, GlobError};
use std::collections::HashMap;
use std::time::Duration;
use stream::Stream;
use tracing::{debug, trace};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis().max(0) as Millis
}

/// A stored value
#[derive(Debug, Clone)]
pub enum Value {
    String(Bytes),
    Stream(Stream),
}

impl Value {
    /// Name reported by TYPE.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Stream(_) => "stream",
        }
    }
}

/// A single keyspace entry
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute expiration time (None = never expires)
    expires_at: Option<Millis>,
}

impl Entry {
    fn is_expired(&self, now: Millis) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The keyspace
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including ones that expired but were not swept yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop `key` if its expiry has passed. Returns true when it was removed.
    fn expire_if_needed(&mut self, key: &str, now: Millis) -> bool {
        let expired = self.entries.get(key).is_some_and(|e| e.is_expired(now));
        if expired {
            trace!(key, "Key expired on access");
            self.entries.remove(key);
        }
        expired
    }

    /// Get a value, applying passive expiry.
    pub fn get(&mut self, key: &str, now: Millis) -> Option<&Value> {
        self.expire_if_needed(key, now);
        self.entries.get(key).map(|e| &e.value)
    }

    /// Get a mutable value, applying passive expiry.
    pub fn get_mut(&mut self, key: &str, now: Millis) -> Option<&mut Value> {
        self.expire_if_needed(key, now);
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Store a value with an absolute expiry, replacing any previous entry.
    ///
    /// This is also the ingestion call used by the snapshot loader.
    pub fn set(&mut self, key: impl Into<String>, value: Value, expires_at: Option<Millis>) {
        let key = key.into();
        trace!(key = %key, ?expires_at, "Key stored");
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Store a value with a relative TTL; a missing or zero TTL clears expiry.
    pub fn set_with_ttl(
        &mut self,
        key: impl Into<String>,
        value: Value,
        ttl: Option<Duration>,
        now: Millis,
    ) {
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| now.saturating_add(ttl.as_millis() as Millis));
        self.set(key, value, expires_at);
    }

    /// Drop every key. Used before a full resync loads the primary's data.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every key whose expiry is at or before `now`.
    pub fn sweep_expired(&mut self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired keys");
        }
        removed
    }

    /// Live keys matching a glob pattern, sorted for stable output.
    pub fn keys(&mut self, pattern: &str, now: Millis) -> Result<Vec<String>, GlobError> {
        let glob = Glob::new(pattern)?;
        self.sweep_expired(now);
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .filter(|key| glob.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// TYPE of a key: "string", "stream" or "none".
    pub fn type_of(&mut self, key: &str, now: Millis) -> &'static str {
        self.get(key, now).map_or("none", Value::type_name)
    }

    /// Iterate live entries as `(key, value, expires_at)`.
    pub fn iter_live(&self, now: Millis) -> impl Iterator<Item = (&str, &Value, Option<Millis>)> {
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.as_str(), &entry.value, entry.expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(s: &str) -> Value {
        Value::String(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn get_string(ks: &mut Keyspace, key: &str, now: Millis) -> Option<Bytes> {
        match ks.get(key, now) {
            Some(Value::String(b)) => Some(b.clone()),
            Some(other) => panic!("unexpected: {:?}", other),
            None => None,
        }
    }

    #[test]
    fn test_basic_set_get() {
        let mut ks = Keyspace::new();
        ks.set("key1", string("value1"), None);
        assert_eq!(get_string(&mut ks, "key1", 0).unwrap(), "value1");
        assert!(ks.get("missing", 0).is_none());
    }

    #[test]
    fn test_ttl_boundary() {
        let mut ks = Keyspace::new();
        let now = 1_000;
        ks.set_with_ttl("foo", string("bar"), Some(Duration::from_millis(100)), now);

        assert!(get_string(&mut ks, "foo", now).is_some());
        assert!(get_string(&mut ks, "foo", now + 99).is_some());
        assert!(get_string(&mut ks, "foo", now + 100).is_none());
        // Removed on access
        assert_eq!(ks.len(), 0);
    }

    #[test]
    fn test_set_clears_previous_expiry() {
        let mut ks = Keyspace::new();
        ks.set_with_ttl("k", string("a"), Some(Duration::from_millis(10)), 0);
        ks.set_with_ttl("k", string("b"), None, 0);
        assert_eq!(get_string(&mut ks, "k", 1_000_000).unwrap(), "b");

        ks.set_with_ttl("z", string("a"), Some(Duration::ZERO), 0);
        assert!(get_string(&mut ks, "z", 1_000_000).is_some());
    }

    #[test]
    fn test_sweep_expired() {
        let mut ks = Keyspace::new();
        ks.set("a", string("1"), Some(50));
        ks.set("b", string("2"), Some(150));
        ks.set("c", string("3"), None);

        assert_eq!(ks.sweep_expired(100), 1);
        assert_eq!(ks.len(), 2);
        assert_eq!(ks.sweep_expired(150), 1);
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn test_keys_skips_expired() {
        let mut ks = Keyspace::new();
        ks.set("user:1", string("a"), None);
        ks.set("user:2", string("b"), Some(10));
        ks.set("session:1", string("c"), None);

        assert_eq!(ks.keys("user:*", 20).unwrap(), vec!["user:1"]);
        assert_eq!(ks.keys("*", 20).unwrap(), vec!["session:1", "user:1"]);
        assert!(ks.keys("[", 20).is_err());
    }

    #[test]
    fn test_type_of() {
        let mut ks = Keyspace::new();
        ks.set("s", string("x"), None);
        ks.set("st", Value::Stream(Stream::new()), None);
        assert_eq!(ks.type_of("s", 0), "string");
        assert_eq!(ks.type_of("st", 0), "stream");
        assert_eq!(ks.type_of("nope", 0), "none");
    }

    #[test]
    fn test_iter_live() {
        let mut ks = Keyspace::new();
        ks.set("a", string("1"), Some(5));
        ks.set("b", string("2"), Some(500));
        let live: Vec<_> = ks.iter_live(100).map(|(k, _, exp)| (k, exp)).collect();
        assert_eq!(live, vec![("b", Some(500))]);
    }
}
