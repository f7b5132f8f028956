//! Auto-End Controller (C6, spec.md §4.6).
//!
//! One self-scheduling task per channel, spawned the first time a listener count is
//! reported and torn down once the channel is cancelled or the controller itself
//! shuts down. Grounded on the teacher's `scheduler/actor/streamer_actor.rs`
//! self-scheduling idiom (a task that `tokio::select!`s between its own inbox and a
//! `sleep_until` deadline it recomputes each pass) adapted from "poll a streamer's
//! liveness" to "arm/disarm an idle timer".
//!
//! Armed timers are mirrored into the shared store under `auto_end:{channel_id}` with
//! a TTL equal to the remaining timeout, so [`AutoEndController::reconcile_on_restart`]
//! can recover armed state after a process restart without a dedicated database table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::events::{Envelope, EventHub, Payload};
use crate::metrics::MetricsCollector;
use crate::shared_store::SharedStore;

/// The one thing this module needs in order to actually end a stream: a way to ask
/// the Process Controller (C8) to stop a channel's worker. Kept as a trait so this
/// module has no compile-time dependency on `process`.
#[async_trait]
pub trait AutoEndStopper: Send + Sync {
    async fn request_stop(&self, channel_id: &str, reason: &str) -> Result<()>;
}

const DEBOUNCE: Duration = Duration::from_secs(5);
const MIN_TIMEOUT_SECONDS: u64 = 60;
const MAX_TIMEOUT_SECONDS: u64 = 3600;

fn clamp_timeout_seconds(requested: u64) -> u64 {
    requested.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)
}

fn store_key(channel_id: &str) -> String {
    format!("auto_end:{channel_id}")
}

/// Persisted armed-timer record (spec.md §4.6's restart-reconciliation requirement).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArmedTimer {
    armed_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    timeout_seconds: u64,
}

enum Command {
    Listeners(u64),
    Cancel,
}

/// Auto-End Controller (C6).
pub struct AutoEndController {
    store: Arc<dyn SharedStore>,
    hub: Arc<EventHub>,
    metrics: Arc<MetricsCollector>,
    stopper: Arc<dyn AutoEndStopper>,
    default_timeout_seconds: u64,
    warning_points_seconds: Vec<u64>,
    channels: DashMap<String, mpsc::UnboundedSender<Command>>,
}

impl AutoEndController {
    pub fn new(
        store: Arc<dyn SharedStore>,
        hub: Arc<EventHub>,
        metrics: Arc<MetricsCollector>,
        stopper: Arc<dyn AutoEndStopper>,
        config: &Config,
    ) -> Self {
        let mut warnings = config.auto_end_warning_points_seconds.clone();
        warnings.sort_unstable_by(|a, b| b.cmp(a));
        warnings.dedup();
        Self {
            store,
            hub,
            metrics,
            stopper,
            default_timeout_seconds: clamp_timeout_seconds(config.auto_end_timeout_default_seconds),
            warning_points_seconds: warnings,
            channels: DashMap::new(),
        }
    }

    /// Reports the current listener count for `channel_id` (spec.md §4.6: every
    /// `listeners_update` feeds this). Spawns the channel's self-scheduling task on
    /// first use.
    pub fn report_listeners(&self, channel_id: &str, count: u64) {
        let tx = self.ensure_task(channel_id, self.default_timeout_seconds);
        let _ = tx.send(Command::Listeners(count));
    }

    /// Cancels any in-flight timer for `channel_id` (the channel was stopped through
    /// some other path — an operator `Stop`, a worker crash — so auto-end no longer
    /// applies).
    pub fn cancel(&self, channel_id: &str) {
        if let Some((_, tx)) = self.channels.remove(channel_id) {
            let _ = tx.send(Command::Cancel);
        }
    }

    /// Called once at controller startup with the set of channels the Process
    /// Controller believes are currently running. Restores armed timers from the
    /// shared store: a timer whose deadline has already passed fires immediately with
    /// no warning replay; one still in the future is re-armed with its remaining
    /// warnings recomputed against the clock.
    pub async fn reconcile_on_restart(&self, running_channel_ids: &[String]) {
        for channel_id in running_channel_ids {
            let Ok(Some(raw)) = self.store.get(&store_key(channel_id)).await else { continue };
            let Ok(timer) = serde_json::from_str::<ArmedTimer>(&raw) else { continue };

            let now = Utc::now();
            if timer.deadline <= now {
                info!(channel_id, "auto-end timer already expired across restart, firing now");
                self.fire(channel_id, "restart_reconciliation").await;
                continue;
            }

            let remaining = (timer.deadline - now).num_seconds().max(0) as u64;
            info!(channel_id, remaining_seconds = remaining, "restoring armed auto-end timer across restart");
            let tx = self.spawn_task(channel_id.clone());
            self.channels.insert(channel_id.clone(), tx.clone());
            let _ = tx.send(Command::Listeners(0));
        }
    }

    fn ensure_task(&self, channel_id: &str, _timeout_seconds: u64) -> mpsc::UnboundedSender<Command> {
        if let Some(existing) = self.channels.get(channel_id) {
            return existing.clone();
        }
        let tx = self.spawn_task(channel_id.to_string());
        self.channels.insert(channel_id.to_string(), tx.clone());
        tx
    }

    fn spawn_task(&self, channel_id: String) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.store.clone();
        let hub = self.hub.clone();
        let metrics = self.metrics.clone();
        let stopper = self.stopper.clone();
        let timeout = Duration::from_secs(self.default_timeout_seconds);
        let warnings = self.warning_points_seconds.clone();

        tokio::spawn(run_channel(channel_id, rx, store, hub, metrics, stopper, timeout, warnings));
        tx
    }
}

async fn run_channel(
    channel_id: String,
    mut rx: mpsc::UnboundedReceiver<Command>,
    store: Arc<dyn SharedStore>,
    hub: Arc<EventHub>,
    metrics: Arc<MetricsCollector>,
    stopper: Arc<dyn AutoEndStopper>,
    timeout: Duration,
    warnings_desc: Vec<u64>,
) {
    let mut listeners: u64 = 0;

    'idle: loop {
        match rx.recv().await {
            Some(Command::Listeners(n)) => listeners = n,
            Some(Command::Cancel) | None => return,
        }
        if listeners != 0 {
            continue 'idle;
        }

        // Debounce: a single zero reading doesn't arm the timer, only a sustained one.
        tokio::select! {
            _ = tokio::time::sleep(DEBOUNCE) => {}
            msg = rx.recv() => match msg {
                Some(Command::Listeners(n)) => { listeners = n; continue 'idle; }
                Some(Command::Cancel) | None => return,
            }
        }
        if listeners != 0 {
            continue 'idle;
        }

        let armed_at = Utc::now();
        let deadline_utc = armed_at + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero());
        let deadline_instant = Instant::now() + timeout;
        let record = ArmedTimer { armed_at, deadline: deadline_utc, timeout_seconds: timeout.as_secs() };
        let _ = store
            .set(&store_key(&channel_id), serde_json::to_string(&record).expect("serializes"), Some(timeout))
            .await;
        debug!(channel_id = %channel_id, "auto-end timer armed");

        let mut checkpoints: Vec<Instant> = warnings_desc
            .iter()
            .filter(|secs| Duration::from_secs(**secs) < timeout)
            .map(|secs| deadline_instant - Duration::from_secs(*secs))
            .filter(|at| *at > Instant::now())
            .collect();
        checkpoints.push(deadline_instant);

        'armed: for (idx, checkpoint) in checkpoints.iter().enumerate() {
            let is_deadline = idx == checkpoints.len() - 1;
            tokio::select! {
                _ = tokio::time::sleep_until(*checkpoint) => {
                    if is_deadline {
                        let _ = store.delete(&store_key(&channel_id)).await;
                        fire_from_task(&channel_id, &hub, &metrics, &stopper).await;
                        continue 'idle;
                    } else {
                        let remaining = (deadline_instant.saturating_duration_since(Instant::now())).as_secs();
                        hub.publish(Envelope::new(
                            Some(channel_id.clone()),
                            Payload::AutoEndWarning { seconds_remaining: remaining },
                        ));
                    }
                }
                msg = rx.recv() => match msg {
                    Some(Command::Listeners(n)) if n > 0 => {
                        listeners = n;
                        let _ = store.delete(&store_key(&channel_id)).await;
                        debug!(channel_id = %channel_id, "auto-end timer disarmed, listeners returned");
                        continue 'idle;
                    }
                    Some(Command::Listeners(n)) => { listeners = n; }
                    Some(Command::Cancel) | None => return,
                }
            }
        }
        let _ = armed_at;
    }
}

async fn fire_from_task(
    channel_id: &str,
    hub: &Arc<EventHub>,
    metrics: &Arc<MetricsCollector>,
    stopper: &Arc<dyn AutoEndStopper>,
) {
    info!(channel_id, "auto-end timer fired, requesting stop");
    metrics.record_auto_end_triggered(channel_id, "no_listeners");
    hub.publish(Envelope::new(
        Some(channel_id.to_string()),
        Payload::AutoEndTriggered { reason: "no_listeners".to_string() },
    ));
    if let Err(err) = stopper.request_stop(channel_id, "no_listeners").await {
        tracing::warn!(channel_id, error = %err, "auto-end stop request failed");
    }
}

impl AutoEndController {
    async fn fire(&self, channel_id: &str, reason: &str) {
        self.metrics.record_auto_end_triggered(channel_id, reason);
        self.hub.publish(Envelope::new(
            Some(channel_id.to_string()),
            Payload::AutoEndTriggered { reason: reason.to_string() },
        ));
        if let Err(err) = self.stopper.request_stop(channel_id, reason).await {
            tracing::warn!(channel_id, error = %err, "auto-end stop request failed during reconciliation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_store::InMemorySharedStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingStopper {
        calls: AsyncMutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl RecordingStopper {
        fn new() -> Self {
            Self { calls: AsyncMutex::new(Vec::new()), count: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl AutoEndStopper for RecordingStopper {
        async fn request_stop(&self, channel_id: &str, _reason: &str) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().await.push(channel_id.to_string());
            Ok(())
        }
    }

    fn test_config(timeout_seconds: u64) -> Config {
        let mut config = Config::default();
        config.auto_end_timeout_default_seconds = timeout_seconds;
        config.auto_end_warning_points_seconds = vec![];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_sustained_zero_listeners() {
        let stopper = Arc::new(RecordingStopper::new());
        let controller = AutoEndController::new(
            Arc::new(InMemorySharedStore::new()),
            Arc::new(EventHub::new(Arc::new(MetricsCollector::new()))),
            Arc::new(MetricsCollector::new()),
            stopper.clone(),
            &test_config(MIN_TIMEOUT_SECONDS),
        );

        controller.report_listeners("ch-1", 0);
        tokio::time::advance(DEBOUNCE + Duration::from_secs(MIN_TIMEOUT_SECONDS + 1)).await;
        tokio::task::yield_now().await;

        assert_eq!(stopper.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_listener_arriving_during_debounce_cancels_the_timer() {
        let stopper = Arc::new(RecordingStopper::new());
        let controller = AutoEndController::new(
            Arc::new(InMemorySharedStore::new()),
            Arc::new(EventHub::new(Arc::new(MetricsCollector::new()))),
            Arc::new(MetricsCollector::new()),
            stopper.clone(),
            &test_config(MIN_TIMEOUT_SECONDS),
        );

        controller.report_listeners("ch-1", 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        controller.report_listeners("ch-1", 3);
        tokio::time::advance(Duration::from_secs(MIN_TIMEOUT_SECONDS + 10)).await;
        tokio::task::yield_now().await;

        assert_eq!(stopper.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_is_clamped_to_bounds() {
        assert_eq!(clamp_timeout_seconds(10), MIN_TIMEOUT_SECONDS);
        assert_eq!(clamp_timeout_seconds(100_000), MAX_TIMEOUT_SECONDS);
        assert_eq!(clamp_timeout_seconds(300), 300);
    }
}
