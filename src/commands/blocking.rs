//! Registry of connections suspended in a blocking XREAD.
//!
//! Readers are indexed by connection and by every stream key they watch, so
//! an append only re-evaluates the readers of that key. Both maps live on the
//! reactor thread inside the dispatcher and are never shared.

use crate::outbox::ConnId;
use crate::storage::stream::StreamId;
use crate::storage::Millis;
use std::collections::HashMap;

/// A suspended XREAD with every `$` already resolved to a concrete ID.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedReader {
    pub conn: ConnId,
    pub streams: Vec<(String, StreamId)>,
    pub count: Option<usize>,
    /// None blocks until data arrives or the connection closes
    pub deadline: Option<Millis>,
}

#[derive(Debug, Default)]
pub struct BlockedReaders {
    readers: HashMap<ConnId, BlockedReader>,
    by_key: HashMap<String, Vec<ConnId>>,
}

impl BlockedReaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Register a reader. A connection has at most one, so a previous one is replaced.
    pub fn register(&mut self, reader: BlockedReader) {
        self.remove(reader.conn);
        for (key, _) in &reader.streams {
            let watchers = self.by_key.entry(key.clone()).or_default();
            if !watchers.contains(&reader.conn) {
                watchers.push(reader.conn);
            }
        }
        self.readers.insert(reader.conn, reader);
    }

    pub fn get(&self, conn: ConnId) -> Option<&BlockedReader> {
        self.readers.get(&conn)
    }

    /// Connections watching `key`, in registration order.
    pub fn watchers(&self, key: &str) -> Vec<ConnId> {
        self.by_key.get(key).cloned().unwrap_or_default()
    }

    /// Deregister the reader owned by `conn`, if any.
    pub fn remove(&mut self, conn: ConnId) -> Option<BlockedReader> {
        let reader = self.readers.remove(&conn)?;
        for (key, _) in &reader.streams {
            if let Some(watchers) = self.by_key.get_mut(key) {
                watchers.retain(|&c| c != conn);
                if watchers.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        Some(reader)
    }

    /// Connections whose deadline is at or before `now`.
    pub fn expired(&self, now: Millis) -> Vec<ConnId> {
        let mut expired: Vec<ConnId> = self
            .readers
            .values()
            .filter(|r| r.deadline.is_some_and(|d| d <= now))
            .map(|r| r.conn)
            .collect();
        expired.sort_unstable();
        expired
    }
}
