//! The "shared store" capability of spec.md §5/§6.4 and SPEC_FULL §4.0.
//!
//! No external Redis/etcd-equivalent dependency is part of this crate's stack, so the
//! shared store is a trait: atomic increment-with-TTL (rate buckets), get/set-with-TTL
//! (auto-end timers, scheduler dedup keys), an ordered list (FIFO queues), and a
//! score-ordered set (priority queues). `InMemorySharedStore` is the shipped
//! implementation, lock-partitioned by key via `DashMap` so that concurrent callers on
//! different channels never contend — a future out-of-process backend is a drop-in
//! trait implementation; nothing upstream changes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;

/// A single priority-queue member: `(id, score, value)`. Lower score wins.
pub type ZSetEntry = (String, f64, String);

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increments the counter at `key`, setting `ttl` only on first
    /// creation (mirrors a fixed-window counter's `INCR` + conditional `EXPIRE`).
    /// Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Remaining time-to-live for `key`, or `None` if absent/expired.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list_push_back(&self, key: &str, id: String, value: String) -> Result<usize>;
    async fn list_pop_front(&self, key: &str) -> Result<Option<(String, String)>>;
    async fn list_remove(&self, key: &str, id: &str) -> Result<bool>;
    async fn list_move(&self, key: &str, id: &str, new_position: usize) -> Result<bool>;
    async fn list_snapshot(&self, key: &str) -> Result<Vec<(String, String)>>;
    async fn list_clear(&self, key: &str) -> Result<()>;
    async fn list_len(&self, key: &str) -> Result<usize>;

    async fn zset_insert(&self, key: &str, id: String, score: f64, value: String) -> Result<()>;
    async fn zset_pop_min(&self, key: &str) -> Result<Option<ZSetEntry>>;
    async fn zset_peek_min(&self, key: &str) -> Result<Option<ZSetEntry>>;
    async fn zset_remove(&self, key: &str, id: &str) -> Result<bool>;
    async fn zset_snapshot(&self, key: &str) -> Result<Vec<ZSetEntry>>;
    async fn zset_clear(&self, key: &str) -> Result<()>;
    async fn zset_len(&self, key: &str) -> Result<usize>;
}

struct ScalarEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct CounterEntry {
    count: i64,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct ListEntry {
    items: VecDeque<(String, String)>,
}

#[derive(Default)]
struct ZSetEntryStore {
    // Kept sorted by score ascending; small-N linear scan is fine at this scale
    // (queues are capped at `max_length`, default 100).
    items: Vec<(String, f64, String)>,
}

impl ZSetEntryStore {
    fn insert(&mut self, id: String, score: f64, value: String) {
        self.items.retain(|(existing_id, _, _)| existing_id != &id);
        let pos = self
            .items
            .partition_point(|(_, existing_score, _)| *existing_score <= score);
        self.items.insert(pos, (id, score, value));
    }
}

/// In-memory, lock-partitioned implementation of [`SharedStore`].
pub struct InMemorySharedStore {
    scalars: DashMap<String, ScalarEntry>,
    counters: DashMap<String, CounterEntry>,
    lists: DashMap<String, Mutex<ListEntry>>,
    zsets: DashMap<String, Mutex<ZSetEntryStore>>,
}

impl InMemorySharedStore {
    pub fn new() -> Self {
        Self {
            scalars: DashMap::new(),
            counters: DashMap::new(),
            lists: DashMap::new(),
            zsets: DashMap::new(),
        }
    }

    fn is_expired(expires_at: Option<Instant>) -> bool {
        expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl Default for InMemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemorySharedStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| CounterEntry {
            count: 0,
            expires_at: None,
        });

        if Self::is_expired(entry.expires_at) {
            entry.count = 0;
            entry.expires_at = None;
        }

        let first_write = entry.count == 0 && entry.expires_at.is_none();
        entry.count += 1;
        if first_write {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(entry.count)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        if let Some(entry) = self.counters.get(key) {
            if Self::is_expired(entry.expires_at) {
                return Ok(None);
            }
            return Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())));
        }
        if let Some(entry) = self.scalars.get(key) {
            if Self::is_expired(entry.expires_at) {
                return Ok(None);
            }
            return Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())));
        }
        Ok(None)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.scalars.get(key) {
            Some(entry) if !Self::is_expired(entry.expires_at) => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.scalars.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.scalars.remove(key).is_some() || self.counters.remove(key).is_some())
    }

    async fn list_push_back(&self, key: &str, id: String, value: String) -> Result<usize> {
        let entry = self.lists.entry(key.to_string()).or_default();
        let mut guard = entry.lock();
        guard.items.push_back((id, value));
        Ok(guard.items.len())
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<(String, String)>> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(None);
        };
        Ok(entry.lock().items.pop_front())
    }

    async fn list_remove(&self, key: &str, id: &str) -> Result<bool> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(false);
        };
        let mut guard = entry.lock();
        let before = guard.items.len();
        guard.items.retain(|(item_id, _)| item_id != id);
        Ok(guard.items.len() != before)
    }

    async fn list_move(&self, key: &str, id: &str, new_position: usize) -> Result<bool> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(false);
        };
        let mut guard = entry.lock();
        let Some(current_pos) = guard.items.iter().position(|(item_id, _)| item_id == id) else {
            return Ok(false);
        };
        if new_position >= guard.items.len() {
            return Ok(false);
        }
        let item = guard.items.remove(current_pos).expect("position just located");
        guard.items.insert(new_position, item);
        Ok(true)
    }

    async fn list_snapshot(&self, key: &str) -> Result<Vec<(String, String)>> {
        let Some(entry) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entry.lock().items.iter().cloned().collect())
    }

    async fn list_clear(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.lists.get(key) {
            entry.lock().items.clear();
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|e| e.lock().items.len()).unwrap_or(0))
    }

    async fn zset_insert(&self, key: &str, id: String, score: f64, value: String) -> Result<()> {
        let entry = self.zsets.entry(key.to_string()).or_default();
        entry.lock().insert(id, score, value);
        Ok(())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<ZSetEntry>> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(None);
        };
        let mut guard = entry.lock();
        if guard.items.is_empty() {
            Ok(None)
        } else {
            Ok(Some(guard.items.remove(0)))
        }
    }

    async fn zset_peek_min(&self, key: &str) -> Result<Option<ZSetEntry>> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(None);
        };
        Ok(entry.lock().items.first().cloned())
    }

    async fn zset_remove(&self, key: &str, id: &str) -> Result<bool> {
        let Some(entry) = self.zsets.get(key) else {
            return Ok(false);
        };
        let mut guard = entry.lock();
        let before = guard.items.len();
        guard.items.retain(|(item_id, _, _)| item_id != id);
        Ok(guard.items.len() != before)
    }

    async fn zset_snapshot(&self, key: &str) -> Result<Vec<ZSetEntry>> {
        Ok(self
            .zsets
            .get(key)
            .map(|e| e.lock().items.clone())
            .unwrap_or_default())
    }

    async fn zset_clear(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.zsets.get(key) {
            entry.lock().items.clear();
        }
        Ok(())
    }

    async fn zset_len(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.get(key).map(|e| e.lock().items.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_resets_after_ttl_window() {
        let store = InMemorySharedStore::new();
        assert_eq!(store.incr("rate:standard:u1:0", Duration::from_millis(20)).await.unwrap(), 1);
        assert_eq!(store.incr("rate:standard:u1:0", Duration::from_millis(20)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.incr("rate:standard:u1:0", Duration::from_millis(20)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_push_pop_and_move() {
        let store = InMemorySharedStore::new();
        store.list_push_back("queue:ch", "a".into(), "A".into()).await.unwrap();
        store.list_push_back("queue:ch", "b".into(), "B".into()).await.unwrap();
        store.list_push_back("queue:ch", "c".into(), "C".into()).await.unwrap();
        store.list_move("queue:ch", "c", 0).await.unwrap();
        let snap = store.list_snapshot("queue:ch").await.unwrap();
        assert_eq!(snap.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn zset_pop_min_returns_lowest_score() {
        let store = InMemorySharedStore::new();
        store.zset_insert("pri:ch", "user".into(), 2000.0, "U".into()).await.unwrap();
        store.zset_insert("pri:ch", "admin".into(), 1000.0, "A".into()).await.unwrap();
        store.zset_insert("pri:ch", "vip".into(), 0.0, "V".into()).await.unwrap();
        let (id, _, _) = store.zset_pop_min("pri:ch").await.unwrap().unwrap();
        assert_eq!(id, "vip");
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let store = InMemorySharedStore::new();
        store.set("auto_end:ch", "armed".into(), Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(store.get("auto_end:ch").await.unwrap(), Some("armed".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("auto_end:ch").await.unwrap(), None);
    }
}
