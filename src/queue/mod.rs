//! Queue Engine (C3, spec.md §4.3).
//!
//! Per-channel ordered playback queue, FIFO or priority discipline, backed by the
//! shared store's list/zset primitives so mutations are atomic across callers of the
//! same channel without a long-held in-process lock. Grounded on the shape of the
//! teacher's `pipeline/job_queue.rs` (depth thresholds, a small `*Config` struct,
//! queue-depth status), adapted from a database-backed job queue to a
//! shared-store-backed playback queue per spec.md §4.3.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{PlaylistItem, PriorityRole};
use crate::error::{Error, Result};
use crate::events::{Envelope, EventHub, Payload, QueueAction};
use crate::metrics::MetricsCollector;
use crate::shared_store::SharedStore;

/// Ordering discipline a channel's queue operates under (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    Fifo,
    Priority,
}

impl Discipline {
    fn as_str(self) -> &'static str {
        match self {
            Discipline::Fifo => "fifo",
            Discipline::Priority => "priority",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "priority" => Discipline::Priority,
            _ => Discipline::Fifo,
        }
    }
}

/// Outcome of a [`QueueEngine::remove`]/[`QueueEngine::move_item`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Ok,
    NotFound,
    InvalidPosition,
}

fn queue_key(channel_id: &str) -> String {
    format!("queue:{channel_id}")
}

fn state_key(channel_id: &str) -> String {
    format!("queue_state:{channel_id}")
}

/// Persisted per-channel queue metadata: discipline, configured `max_length`, and
/// whether placeholder playback is currently active.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueState {
    discipline: String,
    max_length: usize,
    is_placeholder_active: bool,
}

impl Default for QueueState {
    fn default() -> Self {
        Self { discipline: Discipline::Fifo.as_str().to_string(), max_length: 100, is_placeholder_active: false }
    }
}

/// Per-channel ordered playback queue (C3).
pub struct QueueEngine {
    store: Arc<dyn SharedStore>,
    metrics: Arc<MetricsCollector>,
    hub: Arc<EventHub>,
    default_max_length: usize,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn SharedStore>, metrics: Arc<MetricsCollector>, hub: Arc<EventHub>, default_max_length: usize) -> Self {
        Self { store, metrics, hub, default_max_length }
    }

    async fn load_state(&self, channel_id: &str) -> Result<QueueState> {
        match self.store.get(&state_key(channel_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|_| self.default_state())),
            None => Ok(self.default_state()),
        }
    }

    fn default_state(&self) -> QueueState {
        QueueState { max_length: self.default_max_length, ..QueueState::default() }
    }

    async fn save_state(&self, channel_id: &str, state: &QueueState) -> Result<()> {
        let raw = serde_json::to_string(state).expect("QueueState always serializes");
        self.store.set(&state_key(channel_id), raw, None).await
    }

    async fn len(&self, channel_id: &str, discipline: Discipline) -> Result<usize> {
        match discipline {
            Discipline::Fifo => self.store.list_len(&queue_key(channel_id)).await,
            Discipline::Priority => self.store.zset_len(&queue_key(channel_id)).await,
        }
    }

    /// `Add(channel_id, item, requester_role) -> position` (spec.md §4.3).
    pub async fn add(&self, channel_id: &str, mut item: PlaylistItem, requester_role: Option<PriorityRole>) -> Result<usize> {
        item.source.validate()?;
        item.requester_role = requester_role;

        let mut state = self.load_state(channel_id).await?;
        let discipline = Discipline::parse(&state.discipline);
        let current_len = self.len(channel_id, discipline).await?;
        if current_len >= state.max_length {
            return Err(Error::queue_full());
        }

        let key = queue_key(channel_id);
        let payload = serde_json::to_string(&item).expect("PlaylistItem always serializes");
        let zero_based_position = match discipline {
            Discipline::Fifo => {
                let len = self.store.list_push_back(&key, item.id.clone(), payload).await?;
                len.saturating_sub(1)
            }
            Discipline::Priority => {
                let score = item.priority_score();
                self.store.zset_insert(&key, item.id.clone(), score, payload).await?;
                let snapshot = self.store.zset_snapshot(&key).await?;
                snapshot.iter().position(|(id, _, _)| id == &item.id).unwrap_or(0)
            }
        };

        let was_placeholder = state.is_placeholder_active;
        state.is_placeholder_active = false;
        self.save_state(channel_id, &state).await?;

        let size = self.len(channel_id, discipline).await?;
        self.metrics.record_queue_operation(channel_id, "add");
        self.metrics.set_queue_size(channel_id, size as u64);
        self.emit_queue_update(channel_id, QueueAction::Add, Some(&item), size).await;
        if was_placeholder {
            debug!(channel_id, "queue add cleared placeholder flag");
        }
        Ok(zero_based_position)
    }

    /// `PriorityAdd(channel_id, item) -> 0` — front-of-role regardless of configured
    /// discipline; used for moderator/admin "play next" interventions.
    pub async fn priority_add(&self, channel_id: &str, mut item: PlaylistItem) -> Result<usize> {
        item.source.validate()?;
        let mut state = self.load_state(channel_id).await?;
        let key = queue_key(channel_id);

        let len = self.store.zset_len(&key).await?.max(self.store.list_len(&key).await?);
        if len >= state.max_length {
            return Err(Error::queue_full());
        }

        // Force a score lower than any role_base's minimum to guarantee front position.
        let score = -1.0;
        self.store.zset_insert(&key, item.id.clone(), score, serde_json::to_string(&item).expect("serializes")).await?;
        state.discipline = Discipline::Priority.as_str().to_string();
        state.is_placeholder_active = false;
        self.save_state(channel_id, &state).await?;

        self.metrics.record_queue_operation(channel_id, "priority_add");
        self.emit_queue_update(channel_id, QueueAction::PriorityAdd, Some(&item), 1).await;
        Ok(0)
    }

    /// `Remove(channel_id, item_id) -> ok|not_found`.
    pub async fn remove(&self, channel_id: &str, item_id: &str) -> Result<MutationOutcome> {
        let key = queue_key(channel_id);
        let removed_list = self.store.list_remove(&key, item_id).await?;
        let removed_zset = if removed_list { false } else { self.store.zset_remove(&key, item_id).await? };

        if removed_list || removed_zset {
            self.metrics.record_queue_operation(channel_id, "remove");
            let size = self.queue_size(channel_id).await?;
            self.emit_queue_update(channel_id, QueueAction::Remove, None, size).await;
            Ok(MutationOutcome::Ok)
        } else {
            Ok(MutationOutcome::NotFound)
        }
    }

    /// `Move(channel_id, item_id, new_position) -> ok|not_found|invalid_position`.
    /// Only meaningful for FIFO queues; a priority queue's order is derived from
    /// score, not an explicit position, so `Move` against one is `invalid_position`.
    pub async fn move_item(&self, channel_id: &str, item_id: &str, new_position: usize) -> Result<MutationOutcome> {
        let state = self.load_state(channel_id).await?;
        if Discipline::parse(&state.discipline) != Discipline::Fifo {
            return Ok(MutationOutcome::InvalidPosition);
        }
        let key = queue_key(channel_id);
        if self.store.list_move(&key, item_id, new_position).await? {
            self.metrics.record_queue_operation(channel_id, "move");
            let size = self.queue_size(channel_id).await?;
            self.emit_queue_update(channel_id, QueueAction::Move, None, size).await;
            Ok(MutationOutcome::Ok)
        } else {
            let len = self.store.list_len(&key).await?;
            if new_position >= len {
                Ok(MutationOutcome::InvalidPosition)
            } else {
                Ok(MutationOutcome::NotFound)
            }
        }
    }

    /// `Skip(channel_id) -> item_id | none` — pops the current head/min and advances.
    /// Skipping an already-empty queue is a no-op: no state change, no event (spec.md
    /// §8). Placeholder arming is the worker's call, made from its playback loop
    /// (spec.md §4.7.3), since only the worker knows it has actually stopped playing.
    pub async fn skip(&self, channel_id: &str) -> Result<Option<PlaylistItem>> {
        let state = self.load_state(channel_id).await?;
        let key = queue_key(channel_id);
        let popped = match Discipline::parse(&state.discipline) {
            Discipline::Fifo => self.store.list_pop_front(&key).await?.map(|(_, payload)| payload),
            Discipline::Priority => self.store.zset_pop_min(&key).await?.map(|(_, _, payload)| payload),
        };

        match popped {
            Some(payload) => {
                let item: PlaylistItem = serde_json::from_str(&payload)
                    .map_err(|_| Error::decode_failure("playlist item"))?;
                self.metrics.record_queue_operation(channel_id, "skip");
                let size = self.queue_size(channel_id).await?;
                self.metrics.set_queue_size(channel_id, size as u64);
                self.emit_queue_update(channel_id, QueueAction::Remove, Some(&item), size).await;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// `Peek(channel_id) -> item_id | none` without removing it.
    pub async fn peek(&self, channel_id: &str) -> Result<Option<PlaylistItem>> {
        let state = self.load_state(channel_id).await?;
        let key = queue_key(channel_id);
        let raw = match Discipline::parse(&state.discipline) {
            Discipline::Fifo => self.store.list_snapshot(&key).await?.into_iter().next().map(|(_, v)| v),
            Discipline::Priority => self.store.zset_peek_min(&key).await?.map(|(_, _, v)| v),
        };
        match raw {
            Some(payload) => Ok(Some(
                serde_json::from_str(&payload).map_err(|_| Error::decode_failure("playlist item"))?,
            )),
            None => Ok(None),
        }
    }

    /// `Snapshot(channel_id) -> ordered list of item descriptors`.
    pub async fn snapshot(&self, channel_id: &str) -> Result<Vec<PlaylistItem>> {
        let state = self.load_state(channel_id).await?;
        let key = queue_key(channel_id);
        let raws: Vec<String> = match Discipline::parse(&state.discipline) {
            Discipline::Fifo => self.store.list_snapshot(&key).await?.into_iter().map(|(_, v)| v).collect(),
            Discipline::Priority => self.store.zset_snapshot(&key).await?.into_iter().map(|(_, _, v)| v).collect(),
        };
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(|_| Error::decode_failure("playlist item")))
            .collect()
    }

    /// `SetDiscipline(channel_id, discipline) -> ok|has_items` — fails unless empty.
    pub async fn set_discipline(&self, channel_id: &str, discipline: Discipline) -> Result<()> {
        let key = queue_key(channel_id);
        let has_items = self.store.list_len(&key).await? > 0 || self.store.zset_len(&key).await? > 0;
        if has_items {
            return Err(Error::has_items());
        }
        let mut state = self.load_state(channel_id).await?;
        state.discipline = discipline.as_str().to_string();
        self.save_state(channel_id, &state).await
    }

    /// `Migrate(channel_id, from, to) -> count` — explicit one-shot transfer of every
    /// item from `channel_id`'s current queue into `to`'s queue, leaving the source
    /// empty. Item order under the destination's discipline is recomputed from
    /// scratch (FIFO keeps arrival order; priority recomputes each item's score).
    pub async fn migrate(&self, from_channel: &str, to_channel: &str) -> Result<usize> {
        let items = self.snapshot(from_channel).await?;
        let to_state = self.load_state(to_channel).await?;
        let to_discipline = Discipline::parse(&to_state.discipline);
        let key = queue_key(to_channel);

        let mut moved = 0usize;
        for item in &items {
            let payload = serde_json::to_string(item).expect("serializes");
            match to_discipline {
                Discipline::Fifo => {
                    self.store.list_push_back(&key, item.id.clone(), payload).await?;
                }
                Discipline::Priority => {
                    self.store.zset_insert(&key, item.id.clone(), item.priority_score(), payload).await?;
                }
            }
            moved += 1;
        }

        self.store.list_clear(&queue_key(from_channel)).await?;
        self.store.zset_clear(&queue_key(from_channel)).await?;

        let mut from_state = self.load_state(from_channel).await?;
        from_state.is_placeholder_active = false;
        self.save_state(from_channel, &from_state).await?;

        self.metrics.record_queue_operation(to_channel, "migrate");
        let size = self.queue_size(to_channel).await?;
        self.emit_queue_update(to_channel, QueueAction::Add, None, size).await;
        Ok(moved)
    }

    pub async fn is_placeholder_active(&self, channel_id: &str) -> Result<bool> {
        Ok(self.load_state(channel_id).await?.is_placeholder_active)
    }

    /// Records whether placeholder playback is active for `channel_id`. The queue
    /// itself never decides this (skipping an empty queue is a silent no-op per
    /// spec.md §8); the worker's playback loop (spec.md §4.7.3) owns the decision,
    /// since only it knows whether it has actually started or stopped placeholder
    /// playback, and calls this to keep the persisted flag in sync.
    pub async fn set_placeholder_active(&self, channel_id: &str, active: bool) -> Result<()> {
        let mut state = self.load_state(channel_id).await?;
        if state.is_placeholder_active != active {
            state.is_placeholder_active = active;
            self.save_state(channel_id, &state).await?;
            if active {
                self.emit_queue_update(channel_id, QueueAction::Clear, None, 0).await;
            }
        }
        Ok(())
    }

    async fn queue_size(&self, channel_id: &str) -> Result<usize> {
        let state = self.load_state(channel_id).await?;
        self.len(channel_id, Discipline::parse(&state.discipline)).await
    }

    async fn emit_queue_update(&self, channel_id: &str, action: QueueAction, item: Option<&PlaylistItem>, queue_size: usize) {
        let item_json = item.map(|i| serde_json::to_value(i).unwrap_or(serde_json::Value::Null));
        self.hub.publish(Envelope::new(
            Some(channel_id.to_string()),
            Payload::QueueUpdate { action, item: item_json, queue_size },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Source, SourceKind};
    use crate::shared_store::InMemorySharedStore;

    fn engine() -> QueueEngine {
        QueueEngine::new(
            Arc::new(InMemorySharedStore::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(EventHub::new(Arc::new(MetricsCollector::new()))),
            100,
        )
    }

    fn item(id: &str) -> PlaylistItem {
        PlaylistItem::new(id, "ch-1", Source { kind: SourceKind::WebUrl, value: "https://example.org/a.mp3".into() })
    }

    #[tokio::test]
    async fn fifo_add_then_skip_returns_head() {
        let engine = engine();
        engine.add("ch-1", item("a"), None).await.unwrap();
        engine.add("ch-1", item("b"), None).await.unwrap();
        let popped = engine.skip("ch-1").await.unwrap().unwrap();
        assert_eq!(popped.id, "a");
    }

    #[tokio::test]
    async fn priority_discipline_orders_by_role() {
        let engine = engine();
        engine.set_discipline("ch-1", Discipline::Priority).await.unwrap();
        engine.add("ch-1", item("user-item"), Some(PriorityRole::User)).await.unwrap();
        engine.add("ch-1", item("vip-item"), Some(PriorityRole::Vip)).await.unwrap();
        let popped = engine.skip("ch-1").await.unwrap().unwrap();
        assert_eq!(popped.id, "vip-item");
    }

    #[tokio::test]
    async fn set_discipline_fails_when_not_empty() {
        let engine = engine();
        engine.add("ch-1", item("a"), None).await.unwrap();
        let err = engine.set_discipline("ch-1", Discipline::Priority).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn add_fails_when_full() {
        let engine = QueueEngine::new(
            Arc::new(InMemorySharedStore::new()),
            Arc::new(MetricsCollector::new()),
            Arc::new(EventHub::new(Arc::new(MetricsCollector::new()))),
            1,
        );
        engine.add("ch-1", item("a"), None).await.unwrap();
        let err = engine.add("ch-1", item("b"), None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn skip_on_empty_queue_is_a_silent_no_op() {
        let engine = engine();
        assert!(engine.skip("ch-1").await.unwrap().is_none());
        assert!(!engine.is_placeholder_active("ch-1").await.unwrap());
    }

    #[tokio::test]
    async fn set_placeholder_active_is_cleared_by_add() {
        let engine = engine();
        engine.set_placeholder_active("ch-1", true).await.unwrap();
        assert!(engine.is_placeholder_active("ch-1").await.unwrap());
        engine.add("ch-1", item("a"), None).await.unwrap();
        assert!(!engine.is_placeholder_active("ch-1").await.unwrap());
    }

    #[tokio::test]
    async fn migrate_transfers_all_items_and_empties_source() {
        let engine = engine();
        engine.add("ch-1", item("a"), None).await.unwrap();
        engine.add("ch-1", item("b"), None).await.unwrap();
        let moved = engine.migrate("ch-1", "ch-2").await.unwrap();
        assert_eq!(moved, 2);
        assert!(engine.snapshot("ch-1").await.unwrap().is_empty());
        assert_eq!(engine.snapshot("ch-2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_non_http_source() {
        let engine = engine();
        let bad = PlaylistItem::new("a", "ch-1", Source { kind: SourceKind::WebUrl, value: "ftp://x".into() });
        let err = engine.add("ch-1", bad, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
