//! Persistent MQTT fallback queue.
//!
//! When the MQTT publisher cannot deliver, the serialized message is
//! appended here instead of being dropped. The queue lives in its own redb
//! table keyed by a monotonic sequence number, so its contents and ordering
//! survive a restart; on reconnection the publisher drains it oldest-first
//! before resuming normal cadence.

use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::ConfigStore;

const FALLBACK_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("fieldgate_fallback");

/// Default capacity, matching the in-memory data queue.
pub const FALLBACK_CAPACITY: usize = 100;

/// One undelivered message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Seconds since epoch at the time of the failed publish.
    pub timestamp: i64,
}

/// Bounded persistent queue of undelivered MQTT messages.
pub struct FallbackQueue {
    db: Arc<Database>,
    capacity: usize,
}

impl FallbackQueue {
    /// Open the fallback table on the config store's database.
    pub fn open(store: &ConfigStore) -> Result<Self> {
        Self::with_capacity(store, FALLBACK_CAPACITY)
    }

    pub fn with_capacity(store: &ConfigStore, capacity: usize) -> Result<Self> {
        let db = store.database();
        let txn = db.begin_write()?;
        txn.open_table(FALLBACK_TABLE)?;
        txn.commit()?;
        Ok(Self { db, capacity })
    }

    /// Append a message, evicting the oldest entry on overflow.
    pub fn append(&self, entry: &FallbackEntry) -> Result<()> {
        let bytes = bincode::serialize(entry)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FALLBACK_TABLE)?;
            let first = table.first()?.map(|(k, _)| k.value());
            let last = table.last()?.map(|(k, _)| k.value());
            let next = match (first, last) {
                (Some(first), Some(last)) => {
                    if table.len()? as usize >= self.capacity {
                        table.remove(&first)?;
                        tracing::warn!(topic = %entry.topic, "fallback queue full; oldest entry evicted");
                    }
                    last + 1
                }
                _ => 0,
            };
            table.insert(&next, &*bytes)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove and return the oldest message.
    pub fn pop_front(&self) -> Result<Option<FallbackEntry>> {
        let txn = self.db.begin_write()?;
        let popped = {
            let mut table = txn.open_table(FALLBACK_TABLE)?;
            let first_key = table.first()?.map(|(k, _)| k.value());
            let result = match first_key {
                Some(first) => table
                    .remove(&first)?
                    .map(|v| bincode::deserialize::<FallbackEntry>(&v.value().to_vec()))
                    .transpose()?,
                None => None,
            };
            result
        };
        txn.commit()?;
        Ok(popped)
    }

    pub fn len(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FALLBACK_TABLE)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(FALLBACK_TABLE)?;
            let keys: Vec<u64> = table
                .iter()?
                .filter_map(|item| item.ok().map(|(k, _)| k.value()))
                .collect();
            for key in &keys {
                table.remove(key)?;
            }
            keys.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Remove entries older than `max_age_secs` (memory-guard relief).
    /// Returns how many were removed.
    pub fn clear_expired(&self, now_secs: i64, max_age_secs: i64) -> Result<usize> {
        let cutoff = now_secs - max_age_secs;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(FALLBACK_TABLE)?;
            let expired: Vec<u64> = table
                .iter()?
                .filter_map(|item| {
                    let (k, v) = item.ok()?;
                    let entry: FallbackEntry = bincode::deserialize(v.value()).ok()?;
                    (entry.timestamp < cutoff).then(|| k.value())
                })
                .collect();
            for key in &expired {
                table.remove(key)?;
            }
            expired.len()
        };
        txn.commit()?;
        if removed > 0 {
            tracing::info!(removed, "expired fallback entries cleared");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(topic: &str, timestamp: i64) -> FallbackEntry {
        FallbackEntry {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            qos: 1,
            timestamp,
        }
    }

    #[test]
    fn test_append_pop_order() {
        let store = ConfigStore::ephemeral().unwrap();
        let queue = FallbackQueue::open(&store).unwrap();

        queue.append(&entry("t/1", 100)).unwrap();
        queue.append(&entry("t/2", 101)).unwrap();
        assert_eq!(queue.len().unwrap(), 2);

        assert_eq!(queue.pop_front().unwrap().unwrap().topic, "t/1");
        assert_eq!(queue.pop_front().unwrap().unwrap().topic, "t/2");
        assert!(queue.pop_front().unwrap().is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = ConfigStore::ephemeral().unwrap();
        let queue = FallbackQueue::with_capacity(&store, 3).unwrap();
        for i in 0..5 {
            queue.append(&entry(&format!("t/{}", i), i)).unwrap();
        }
        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(queue.pop_front().unwrap().unwrap().topic, "t/2");
    }

    #[test]
    fn test_clear_expired() {
        let store = ConfigStore::ephemeral().unwrap();
        let queue = FallbackQueue::open(&store).unwrap();
        queue.append(&entry("old", 100)).unwrap();
        queue.append(&entry("fresh", 900)).unwrap();

        let removed = queue.clear_expired(1000, 500).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.pop_front().unwrap().unwrap().topic, "fresh");
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.redb");
        {
            let store = ConfigStore::open(&path).unwrap();
            let queue = FallbackQueue::open(&store).unwrap();
            queue.append(&entry("t/keep", 100)).unwrap();
        }
        let store = ConfigStore::open(&path).unwrap();
        let queue = FallbackQueue::open(&store).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.pop_front().unwrap().unwrap().topic, "t/keep");
    }
}
