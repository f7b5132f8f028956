//! Process Controller (C8, spec.md §4.8).
//!
//! Owns the fleet of per-channel workers behind a `Supervisor` capability boundary,
//! exactly as spec.md §9 describes: "the core treats the host supervisor as a
//! capability rather than encoding any specific unit-file grammar." This crate ships
//! [`TaskSupervisor`], an in-process implementation that runs each worker as a tokio
//! task — the single-binary case spec.md §9 calls out explicitly. Grounded on the
//! teacher's `scheduler/actor/supervisor.rs` (mailbox-driven actor registry) and
//! `scheduler/actor/restart_tracker.rs` (per-actor failure-window bookkeeping), though
//! the restart policy itself is spec.md §4.8's fixed rule rather than the teacher's
//! exponential backoff.

mod restart_tracker;
mod supervisor;

pub use restart_tracker::RestartTracker;
pub use supervisor::{SupervisorStatus, TaskSupervisor};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{Channel, DesiredState, ObservedState, WorkerLifecycle, WorkerRecord};
use crate::error::Result;
use crate::events::{AlertLevel, Envelope, EventHub, Payload};
use crate::metrics::HealthSummary;
use crate::session::SessionManager;
use crate::worker::{WorkerDeps, WorkerHandle};
use supervisor::Supervisor;

/// Abstraction over the Channel/WorkerRecord repositories so this module does not
/// depend on sqlx directly.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn load(&self, channel_id: &str) -> Result<Channel>;
    async fn list_desired_running(&self) -> Result<Vec<Channel>>;
    async fn set_observed_state(&self, channel_id: &str, state: ObservedState) -> Result<()>;
    async fn load_worker_record(&self, channel_id: &str) -> Result<WorkerRecord>;
    async fn save_worker_record(&self, record: &WorkerRecord) -> Result<()>;
}

/// One "start a channel's worker" call needs a fresh `WorkerDeps` bundle built from
/// live per-channel state (codec profile, encoder params); a factory closure keeps
/// this module from depending on the concrete transport/resolver implementations.
pub type WorkerDepsFactory = Arc<dyn Fn(&Channel) -> WorkerDeps + Send + Sync>;

const RESTART_DELAY: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const FAILURE_WINDOW: Duration = Duration::from_secs(600);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Process Controller (C8).
pub struct ProcessController {
    store: Arc<dyn ChannelStore>,
    hub: Arc<EventHub>,
    session: Arc<SessionManager>,
    deps_factory: WorkerDepsFactory,
    config: Config,
    handles: Mutex<HashMap<String, WorkerHandle>>,
    /// Channels whose worker task is exiting because `stop()`/`restart()` asked it
    /// to, so the crash-monitor task for that channel should not treat the exit as
    /// a failure requiring the restart-on-failure policy.
    stopping: Mutex<HashSet<String>>,
    restart_tracker: Mutex<RestartTracker>,
    supervisor: Arc<dyn Supervisor>,
}

impl ProcessController {
    pub fn new(
        store: Arc<dyn ChannelStore>,
        hub: Arc<EventHub>,
        session: Arc<SessionManager>,
        deps_factory: WorkerDepsFactory,
        config: Config,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            store,
            hub,
            session,
            deps_factory,
            config,
            handles: Mutex::new(HashMap::new()),
            stopping: Mutex::new(HashSet::new()),
            restart_tracker: Mutex::new(RestartTracker::new(MAX_CONSECUTIVE_FAILURES, FAILURE_WINDOW)),
            supervisor,
        }
    }

    /// `Start(channel_id)` (spec.md §4.7.4/§4.8). Refuses with `session_unavailable`
    /// if the owning Account is not `active` (the atomicity-of-session-bindings
    /// guarantee), emitting a `system_alert` either way on refusal.
    pub async fn start(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        if self.handles.lock().contains_key(channel_id) {
            return Ok(());
        }

        let channel = self.store.load(channel_id).await?;
        if !self.session.is_account_startable(&channel.account_id).await? {
            self.hub.publish(Envelope::new(
                Some(channel_id.to_string()),
                Payload::SystemAlert {
                    level: AlertLevel::Warning,
                    code: "start_refused_session_unavailable".to_string(),
                    message: format!("channel {channel_id} refused: account session unavailable"),
                },
            ));
            return Err(crate::error::Error::session_unavailable());
        }

        let mut record = self.store.load_worker_record(channel_id).await.unwrap_or_else(|_| WorkerRecord::new(channel_id));
        record.transition_to(WorkerLifecycle::Starting).ok();
        record.started_at = Some(Utc::now());
        record.handle = Some(format!("task:{channel_id}"));
        let _ = self.store.save_worker_record(&record).await;
        let _ = self.store.set_observed_state(channel_id, ObservedState::Starting).await;

        self.spawn_worker_and_monitor(channel).await;

        record.transition_to(WorkerLifecycle::Running).ok();
        let _ = self.store.save_worker_record(&record).await;
        let _ = self.store.set_observed_state(channel_id, ObservedState::Running).await;
        info!(channel_id, "worker started");
        Ok(())
    }

    /// Spawns the worker task, registers it with the supervisor for forced
    /// termination, and spawns a monitor task that awaits the worker's own
    /// completion so an unexpected exit (crash, auth error, persistent transport
    /// failure) feeds [`Self::record_worker_exit`] even when nobody called `stop()`.
    async fn spawn_worker_and_monitor(self: &Arc<Self>, channel: Channel) {
        let channel_id = channel.id.clone();
        let deps = (self.deps_factory)(&channel);
        let (handle, join) = crate::worker::spawn(channel, deps, &self.config);
        self.supervisor.register(&channel_id, join.abort_handle()).await;
        self.handles.lock().insert(channel_id.clone(), handle);

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let result = join.await;
            if controller.stopping.lock().remove(&channel_id) {
                return;
            }
            let reason = match result {
                Ok(()) => "worker task exited without an explicit stop request".to_string(),
                Err(join_err) if join_err.is_cancelled() => return,
                Err(join_err) => format!("worker task panicked: {join_err}"),
            };
            controller.record_worker_exit(&channel_id, Some(reason)).await;
        });
    }

    /// `Stop(channel_id)` (spec.md §4.7.4). Cooperative first: signals the worker's
    /// own graceful-stop window; if that window elapses before the worker task
    /// finishes, force-terminates it via the supervisor.
    pub async fn stop(&self, channel_id: &str) -> Result<()> {
        let handle = self.handles.lock().remove(channel_id);
        let Some(handle) = handle else { return Ok(()) };
        self.stopping.lock().insert(channel_id.to_string());

        let _ = self.store.set_observed_state(channel_id, ObservedState::Stopping).await;
        if tokio::time::timeout(self.config.worker_graceful_stop(), handle.stop()).await.is_err() {
            warn!(channel_id, "graceful stop window elapsed, force-terminating worker");
            let _ = self.supervisor.terminate(channel_id).await;
        } else {
            self.supervisor.remove(channel_id).await;
        }

        if let Ok(mut record) = self.store.load_worker_record(channel_id).await {
            record.transition_to(WorkerLifecycle::Stopping).ok();
            let _ = self.store.save_worker_record(&record).await;
        }
        let _ = self.store.set_observed_state(channel_id, ObservedState::Stopped).await;
        info!(channel_id, "worker stop requested");
        Ok(())
    }

    /// `Restart(channel_id)` — stop then start with a 1 s gap (spec.md §4.7.4).
    pub async fn restart(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        self.stop(channel_id).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.start(channel_id).await
    }

    pub fn handle_for(&self, channel_id: &str) -> Option<WorkerHandle> {
        self.handles.lock().get(channel_id).cloned()
    }

    pub fn running_channel_ids(&self) -> Vec<String> {
        self.handles.lock().keys().cloned().collect()
    }

    /// Records a worker exit (the worker task completed, whether cleanly or due to
    /// an unrecoverable error) and applies the restart-on-failure policy (spec.md
    /// §4.8): restart after 10 s, unless 5 consecutive failures occurred within the
    /// last 10 minutes, in which case the channel enters `error` and is left alone
    /// until an operator acts.
    pub async fn record_worker_exit(self: &Arc<Self>, channel_id: &str, failure_reason: Option<String>) {
        self.handles.lock().remove(channel_id);

        let Some(reason) = failure_reason else {
            return;
        };

        let mut record = match self.store.load_worker_record(channel_id).await {
            Ok(record) => record,
            Err(_) => WorkerRecord::new(channel_id),
        };
        record.record_failure(reason.clone());
        record.transition_to(WorkerLifecycle::Failed).ok();

        let exceeded = self.restart_tracker.lock().record_failure(channel_id);
        if exceeded {
            let _ = self.store.set_observed_state(channel_id, ObservedState::Error).await;
            let _ = self.store.save_worker_record(&record).await;
            warn!(channel_id, "worker exceeded restart budget, entering error state");
            self.hub.publish(Envelope::new(
                Some(channel_id.to_string()),
                Payload::SystemAlert {
                    level: AlertLevel::Error,
                    code: "worker_restart_budget_exceeded".to_string(),
                    message: format!("channel {channel_id} disabled after repeated failures: {reason}"),
                },
            ));
            return;
        }

        record.next_restart_at = Some(Utc::now() + chrono::Duration::from_std(RESTART_DELAY).unwrap());
        let _ = self.store.save_worker_record(&record).await;

        let channel_id_owned = channel_id.to_string();

        tokio::time::sleep(RESTART_DELAY).await;
        if let Ok(channel) = self.store.load(&channel_id_owned).await {
            if self.session.is_account_startable(&channel.account_id).await.unwrap_or(false) {
                self.spawn_worker_and_monitor(channel).await;
                if let Ok(mut record) = self.store.load_worker_record(&channel_id_owned).await {
                    record.transition_to(WorkerLifecycle::Starting).ok();
                    record.transition_to(WorkerLifecycle::Running).ok();
                    let _ = self.store.save_worker_record(&record).await;
                }
                let _ = self.store.set_observed_state(&channel_id_owned, ObservedState::Running).await;
                info!(channel_id = %channel_id_owned, "worker restarted after failure");
            } else {
                self.hub.publish(Envelope::new(
                    Some(channel_id_owned.clone()),
                    Payload::SystemAlert {
                        level: AlertLevel::Warning,
                        code: "restart_refused_session_unavailable".to_string(),
                        message: format!("channel {channel_id_owned} restart refused: account session unavailable"),
                    },
                ));
            }
        }
    }

    /// Desired-state reconciliation (spec.md §4.8): every 30 s, compares each
    /// Channel's `desired_state` against whether this controller currently has a
    /// running handle for it, and corrects drift.
    pub async fn reconcile_once(self: &Arc<Self>) {
        let channels = match self.store.list_desired_running().await {
            Ok(channels) => channels,
            Err(err) => {
                warn!(error = %err, "reconciliation failed to list channels");
                return;
            }
        };

        let desired_running: std::collections::HashSet<String> =
            channels.iter().filter(|c| c.desired_state == DesiredState::Running).map(|c| c.id.clone()).collect();

        let currently_running: std::collections::HashSet<String> = self.handles.lock().keys().cloned().collect();

        for channel_id in desired_running.difference(&currently_running) {
            info!(channel_id, "reconciliation starting channel to match desired_state=running");
            if let Err(err) = self.start(channel_id).await {
                warn!(channel_id, error = %err, "reconciliation failed to start channel");
            }
        }
        for channel_id in currently_running.difference(&desired_running) {
            info!(channel_id, "reconciliation stopping channel to match desired_state=stopped");
            let _ = self.stop(channel_id).await;
        }
    }

    /// Spawns the background reconciliation loop (every 30 s), cancellable via the
    /// provided token.
    pub fn spawn_reconciliation_loop(self: Arc<Self>, cancellation: tokio_util::sync::CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.reconcile_once().await,
                    _ = cancellation.cancelled() => break,
                }
            }
        });
    }

    /// Per-worker health/log aggregation (spec.md §4.8): queries the store and
    /// metrics, never shells into the host.
    pub async fn health_summary(&self, channel_id: &str, metrics: &crate::metrics::MetricsCollector) -> Result<HealthSummary> {
        let record = self.store.load_worker_record(channel_id).await?;
        let status = match record.lifecycle {
            WorkerLifecycle::Running => crate::metrics::HealthStatus::Healthy,
            WorkerLifecycle::Starting | WorkerLifecycle::Stopping => crate::metrics::HealthStatus::Degraded,
            WorkerLifecycle::Failed => crate::metrics::HealthStatus::Unhealthy,
            WorkerLifecycle::Stopped => crate::metrics::HealthStatus::Unknown,
        };
        Ok(HealthSummary {
            status,
            uptime_secs: record.started_at.map(|at| (Utc::now() - at).num_seconds().max(0) as u64).unwrap_or(0),
            current_track: None,
            queue_size: metrics.queue_size_for(channel_id),
            listeners: metrics.listeners_for(channel_id),
        })
    }
}

#[async_trait]
impl crate::autoend::AutoEndStopper for ProcessController {
    async fn request_stop(&self, channel_id: &str, _reason: &str) -> Result<()> {
        self.stop(channel_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, AccountState, SessionMaterial, StreamKind};
    use crate::events::EventHub;
    use crate::metrics::MetricsCollector;
    use crate::worker::{CodecClassifier, CodecCompatibility, CodecProfile, DriveOutcome, ResolvedSource, SourceResolver, TranscodeDecision, TranscodeStage, VoiceChatTransport};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    struct InMemoryChannels {
        channels: AsyncMutex<HashMap<String, Channel>>,
        records: AsyncMutex<HashMap<String, WorkerRecord>>,
    }

    #[async_trait]
    impl ChannelStore for InMemoryChannels {
        async fn load(&self, channel_id: &str) -> Result<Channel> {
            self.channels.lock().await.get(channel_id).cloned().ok_or_else(|| crate::error::Error::not_found("Channel", channel_id))
        }
        async fn list_desired_running(&self) -> Result<Vec<Channel>> {
            Ok(self.channels.lock().await.values().cloned().collect())
        }
        async fn set_observed_state(&self, channel_id: &str, state: ObservedState) -> Result<()> {
            if let Some(c) = self.channels.lock().await.get_mut(channel_id) {
                c.observed_state = state;
            }
            Ok(())
        }
        async fn load_worker_record(&self, channel_id: &str) -> Result<WorkerRecord> {
            Ok(self.records.lock().await.get(channel_id).cloned().unwrap_or_else(|| WorkerRecord::new(channel_id)))
        }
        async fn save_worker_record(&self, record: &WorkerRecord) -> Result<()> {
            self.records.lock().await.insert(record.channel_id.clone(), record.clone());
            Ok(())
        }
    }

    struct InstantTransport(Arc<AtomicBool>);
    #[async_trait]
    impl VoiceChatTransport for InstantTransport {
        async fn join(&self, _channel_id: &str) -> Result<()> {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn leave(&self, _channel_id: &str) -> Result<()> {
            Ok(())
        }
        async fn drive(
            &self,
            _channel_id: &str,
            _resolved: &ResolvedSource,
            _settings: &crate::worker::PlaybackSettings,
            _listener_tx: mpsc::UnboundedSender<u64>,
            _intents: &mut mpsc::Receiver<crate::worker::WorkerIntent>,
        ) -> Result<DriveOutcome> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(DriveOutcome::NaturalEnd)
        }
    }

    struct NullResolver;
    #[async_trait]
    impl SourceResolver for NullResolver {
        async fn resolve(&self, item: &crate::domain::PlaylistItem) -> Result<ResolvedSource> {
            Ok(ResolvedSource { uri: item.source.value.clone(), container_hint: None })
        }
    }
    struct NativeClassifier;
    impl CodecClassifier for NativeClassifier {
        fn classify(&self, _r: &ResolvedSource) -> CodecProfile {
            CodecProfile { name: "opus".into(), compatibility: CodecCompatibility::Native }
        }
    }
    struct NoopTranscoder;
    impl TranscodeStage for NoopTranscoder {
        fn plan(&self, p: &CodecProfile, _e: &str) -> TranscodeDecision {
            TranscodeDecision { required: false, effective_profile: p.name.clone() }
        }
    }

    fn test_channel(id: &str, account_id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            account_id: account_id.to_string(),
            target_chat_id: "-100".to_string(),
            display_name: "Test".to_string(),
            stream_kind: StreamKind::Audio,
            encoder_params: String::new(),
            placeholder_media_ref: None,
            desired_state: DesiredState::Running,
            observed_state: ObservedState::Stopped,
        }
    }

    fn controller(channels: HashMap<String, Channel>) -> Arc<ProcessController> {
        let metrics = Arc::new(MetricsCollector::new());
        let hub = Arc::new(EventHub::new(metrics.clone()));
        let store = Arc::new(InMemoryChannels { channels: AsyncMutex::new(channels), records: AsyncMutex::new(HashMap::new()) });

        struct AlwaysValid;
        #[async_trait]
        impl crate::session::CredentialValidator for AlwaysValid {
            async fn validate(&self, _m: &SessionMaterial) -> Result<bool> {
                Ok(true)
            }
        }
        struct SingleAccountStore;
        #[async_trait]
        impl crate::session::AccountStore for SingleAccountStore {
            async fn load(&self, account_id: &str) -> Result<Account> {
                Ok(Account::new(account_id, "p", "Ops", SessionMaterial::new("tok")))
            }
            async fn save_state(&self, _id: &str, _s: AccountState) -> Result<()> {
                Ok(())
            }
        }
        let session = Arc::new(SessionManager::new(Arc::new(SingleAccountStore), Arc::new(AlwaysValid), hub.clone(), &Config::default()));

        let joined = Arc::new(AtomicBool::new(false));
        let factory: WorkerDepsFactory = Arc::new(move |_channel| {
            let metrics = Arc::new(MetricsCollector::new());
            let hub = Arc::new(EventHub::new(metrics.clone()));
            let store = Arc::new(crate::shared_store::InMemorySharedStore::new());
            let queue = Arc::new(crate::queue::QueueEngine::new(store.clone(), metrics.clone(), hub.clone(), 100));

            struct NoopStopper;
            #[async_trait]
            impl crate::autoend::AutoEndStopper for NoopStopper {
                async fn request_stop(&self, _c: &str, _r: &str) -> Result<()> {
                    Ok(())
                }
            }
            let autoend = Arc::new(crate::autoend::AutoEndController::new(store, hub.clone(), metrics.clone(), Arc::new(NoopStopper), &Config::default()));

            struct AlwaysValidInner;
            #[async_trait]
            impl crate::session::CredentialValidator for AlwaysValidInner {
                async fn validate(&self, _m: &SessionMaterial) -> Result<bool> {
                    Ok(true)
                }
            }
            struct SingleAccountStoreInner;
            #[async_trait]
            impl crate::session::AccountStore for SingleAccountStoreInner {
                async fn load(&self, account_id: &str) -> Result<Account> {
                    Ok(Account::new(account_id, "p", "Ops", SessionMaterial::new("tok")))
                }
                async fn save_state(&self, _id: &str, _s: AccountState) -> Result<()> {
                    Ok(())
                }
            }
            let session = Arc::new(SessionManager::new(Arc::new(SingleAccountStoreInner), Arc::new(AlwaysValidInner), hub.clone(), &Config::default()));

            WorkerDeps {
                queue,
                hub,
                metrics,
                autoend,
                session,
                resolver: Arc::new(NullResolver),
                classifier: Arc::new(NativeClassifier),
                transcoder: Arc::new(NoopTranscoder),
                transport: Arc::new(InstantTransport(joined.clone())),
            }
        });

        Arc::new(ProcessController::new(store, hub, session, factory, Config::default(), Arc::new(TaskSupervisor::new())))
    }

    #[tokio::test]
    async fn start_refuses_when_account_not_startable() {
        let mut channels = HashMap::new();
        channels.insert("ch-1".to_string(), test_channel("ch-1", "acc-degraded"));
        let controller = controller(channels);

        struct NeverValid;
        #[async_trait]
        impl crate::session::CredentialValidator for NeverValid {
            async fn validate(&self, _m: &SessionMaterial) -> Result<bool> {
                Ok(false)
            }
        }
        controller.session.report_auth_error("acc-degraded").await.unwrap();
        let err = controller.start("ch-1").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn start_then_stop_manages_handle_registry() {
        let mut channels = HashMap::new();
        channels.insert("ch-1".to_string(), test_channel("ch-1", "acc-1"));
        let controller = controller(channels);

        controller.start("ch-1").await.unwrap();
        assert!(controller.handle_for("ch-1").is_some());
        controller.stop("ch-1").await.unwrap();
        assert!(controller.handle_for("ch-1").is_none());
    }
}
