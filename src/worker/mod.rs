//! Streaming Worker (C7, spec.md §4.7).
//!
//! One long-lived task per running Channel (spec.md §9's single-binary resolution:
//! an in-process task stands in for the "separate OS process" spec.md §5 describes;
//! the Process Controller supervises it through the same `Start`/`Stop` contract it
//! would use for a real process). Grounded on the teacher's `domain/streamer/state.rs`
//! transition-table style for [`WorkerState`], and on `downloader/engine/traits.rs`'s
//! capability-trait shape for the pipeline stages in [`traits`].

pub mod default_capabilities;
pub mod traits;

pub use traits::{
    CodecClassifier, CodecCompatibility, CodecProfile, DriveOutcome, PlaybackSettings,
    ResolvedSource, SourceResolver, TranscodeDecision, TranscodeStage, TransportErrorKind,
    VoiceChatTransport,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::autoend::AutoEndController;
use crate::config::Config;
use crate::domain::Channel;
use crate::events::{Envelope, EventHub, Payload, TrackChangeReason, TrackErrorReason};
use crate::metrics::MetricsCollector;
use crate::queue::QueueEngine;
use crate::session::SessionManager;

/// Worker state machine (spec.md §4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Placeholder,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl WorkerState {
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (*self, next),
            (Starting, Running)
                | (Running, Placeholder)
                | (Placeholder, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopping)
                | (Placeholder, Stopping)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Starting, Error)
                | (Running, Error)
                | (Placeholder, Error)
                | (Paused, Error)
                | (Error, Stopping)
        )
    }

    fn label(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Placeholder => "placeholder",
            WorkerState::Paused => "paused",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
        }
    }
}

/// Intents a caller (the HTTP facade, via C8) can send to a running worker.
#[derive(Debug, Clone)]
pub enum WorkerIntent {
    Stop,
    Skip,
    Seek(u64),
    Pause,
    Resume,
    ConfigUpdate(PlaybackSettings),
}

/// Per-channel bootstrap dependencies (spec.md §4.7.4: "a minimal bootstrap").
pub struct WorkerDeps {
    pub queue: Arc<QueueEngine>,
    pub hub: Arc<EventHub>,
    pub metrics: Arc<MetricsCollector>,
    pub autoend: Arc<AutoEndController>,
    pub session: Arc<SessionManager>,
    pub resolver: Arc<dyn SourceResolver>,
    pub classifier: Arc<dyn CodecClassifier>,
    pub transcoder: Arc<dyn TranscodeStage>,
    pub transport: Arc<dyn VoiceChatTransport>,
}

/// Handle C8 (and the facade's `Skip`/`Seek`/config operations) hold to talk to a
/// running worker task. Cloning is cheap; the channel is the single communication
/// path into the worker, matching spec.md §5's "external callers never mutate the
/// playback pointer directly, only via intents the worker drains at a safe point".
#[derive(Clone)]
pub struct WorkerHandle {
    intents: mpsc::Sender<WorkerIntent>,
}

impl WorkerHandle {
    pub async fn stop(&self) {
        let _ = self.intents.send(WorkerIntent::Stop).await;
    }

    pub async fn skip(&self) {
        let _ = self.intents.send(WorkerIntent::Skip).await;
    }

    pub async fn seek(&self, seconds: u64) {
        let _ = self.intents.send(WorkerIntent::Seek(seconds)).await;
    }

    pub async fn pause(&self) {
        let _ = self.intents.send(WorkerIntent::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.intents.send(WorkerIntent::Resume).await;
    }

    pub async fn update_config(&self, settings: PlaybackSettings) {
        let _ = self.intents.send(WorkerIntent::ConfigUpdate(settings)).await;
    }
}

const INTENT_BUFFER: usize = 32;

/// Spawns the worker task for `channel` and returns the handle C8 stores in its
/// registry, plus the raw `JoinHandle` C8 both registers an `AbortHandle` from (for
/// forced termination past the graceful-stop deadline, spec.md §4.7.4) and awaits
/// directly in a monitor task (to detect an unrequested exit). The task reconciles
/// with the store on startup: it re-reads `QueueState` via [`QueueEngine::peek`]
/// rather than assuming anything about prior state.
pub fn spawn(channel: Channel, deps: WorkerDeps, config: &Config) -> (WorkerHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INTENT_BUFFER);
    let graceful_stop = config.worker_graceful_stop();
    let transient_retry_attempts = config.worker_transient_retry_attempts;
    let join = tokio::spawn(run(channel, rx, deps, graceful_stop, transient_retry_attempts));
    (WorkerHandle { intents: tx }, join)
}

fn emit_state(hub: &EventHub, channel_id: &str, state: WorkerState) {
    hub.publish(Envelope::new(
        Some(channel_id.to_string()),
        Payload::StreamState { state: state.label().to_string() },
    ));
}

async fn run(
    channel: Channel,
    mut intents: mpsc::Receiver<WorkerIntent>,
    deps: WorkerDeps,
    graceful_stop: Duration,
    transient_retry_attempts: u32,
) {
    let channel_id = channel.id.clone();
    deps.metrics.stream_started();

    if let Err(err) = deps.transport.join(&channel_id).await {
        error!(channel_id = %channel_id, error = %err, "worker failed to join transport");
        emit_state(&deps.hub, &channel_id, WorkerState::Error);
        deps.metrics.stream_stopped();
        return;
    }

    let mut state = WorkerState::Running;
    emit_state(&deps.hub, &channel_id, state);

    let mut is_placeholder_active = false;
    let mut settings = PlaybackSettings::default();
    let mut current_item_id: Option<String> = None;

    'outer: loop {
        if matches!(state, WorkerState::Paused) {
            match intents.recv().await {
                Some(WorkerIntent::Resume) => {
                    state = WorkerState::Running;
                    emit_state(&deps.hub, &channel_id, state);
                }
                Some(WorkerIntent::Stop) | None => break 'outer,
                Some(WorkerIntent::ConfigUpdate(s)) => apply_config(&deps, &channel_id, &mut settings, s),
                Some(WorkerIntent::Skip) | Some(WorkerIntent::Seek(_)) => {}
            }
            continue 'outer;
        }

        if let Ok(intent) = intents.try_recv() {
            match intent {
                WorkerIntent::Stop => break 'outer,
                WorkerIntent::Pause => {
                    state = WorkerState::Paused;
                    emit_state(&deps.hub, &channel_id, state);
                    continue 'outer;
                }
                WorkerIntent::ConfigUpdate(s) => apply_config(&deps, &channel_id, &mut settings, s),
                WorkerIntent::Resume | WorkerIntent::Skip | WorkerIntent::Seek(_) => {}
            }
        }

        let item = match deps.queue.peek(&channel_id).await {
            Ok(item) => item,
            Err(err) => {
                warn!(channel_id = %channel_id, error = %err, "queue peek failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue 'outer;
            }
        };

        let Some(item) = item else {
            if !is_placeholder_active {
                is_placeholder_active = true;
                state = WorkerState::Placeholder;
                emit_state(&deps.hub, &channel_id, state);
                if let Err(err) = deps.queue.set_placeholder_active(&channel_id, true).await {
                    warn!(channel_id = %channel_id, error = %err, "failed to persist placeholder-active flag");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                intent = intents.recv() => match intent {
                    Some(WorkerIntent::Stop) | None => break 'outer,
                    Some(WorkerIntent::ConfigUpdate(s)) => apply_config(&deps, &channel_id, &mut settings, s),
                    Some(WorkerIntent::Pause) => { state = WorkerState::Paused; emit_state(&deps.hub, &channel_id, state); }
                    Some(WorkerIntent::Resume) | Some(WorkerIntent::Skip) | Some(WorkerIntent::Seek(_)) => {}
                }
            }
            continue 'outer;
        };

        if is_placeholder_active {
            is_placeholder_active = false;
            if let Err(err) = deps.queue.set_placeholder_active(&channel_id, false).await {
                warn!(channel_id = %channel_id, error = %err, "failed to persist placeholder-active flag");
            }
        }
        if !matches!(state, WorkerState::Running) {
            state = WorkerState::Running;
            emit_state(&deps.hub, &channel_id, state);
        }

        let mut attempt: u32 = 0;
        'attempt: loop {
            let resolved = match deps.resolver.resolve(&item).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(channel_id = %channel_id, item_id = %item.id, error = %err, "source resolve failed");
                    deps.hub.publish(Envelope::new(
                        Some(channel_id.clone()),
                        Payload::TrackError { item_id: item.id.clone(), reason: TrackErrorReason::Unreachable },
                    ));
                    let _ = deps.queue.skip(&channel_id).await;
                    break 'attempt;
                }
            };

            let profile = deps.classifier.classify(&resolved);
            let _decision = deps.transcoder.plan(&profile, &channel.encoder_params);

            deps.hub.publish(Envelope::new(
                Some(channel_id.clone()),
                Payload::TrackChange {
                    previous_id: current_item_id.take(),
                    current_id: Some(item.id.clone()),
                    reason: TrackChangeReason::Natural,
                },
            ));
            current_item_id = Some(item.id.clone());

            let (listener_tx, mut listener_rx) = mpsc::unbounded_channel::<u64>();
            let autoend = deps.autoend.clone();
            let metrics_for_listeners = deps.metrics.clone();
            let channel_id_for_listeners = channel_id.clone();
            let listener_task = tokio::spawn(async move {
                while let Some(count) = listener_rx.recv().await {
                    autoend.report_listeners(&channel_id_for_listeners, count);
                    metrics_for_listeners.set_stream_listeners(channel_id_for_listeners.clone(), count);
                }
            });

            let outcome = deps
                .transport
                .drive(&channel_id, &resolved, &settings, listener_tx, &mut intents)
                .await;
            listener_task.abort();

            match outcome {
                Ok(DriveOutcome::NaturalEnd) => {
                    deps.metrics.record_track_played();
                    let _ = deps.queue.skip(&channel_id).await;
                    break 'attempt;
                }
                Ok(DriveOutcome::Skipped) => {
                    let _ = deps.queue.skip(&channel_id).await;
                    break 'attempt;
                }
                Ok(DriveOutcome::Stopped) => break 'outer,
                Ok(DriveOutcome::TransportError(TransportErrorKind::Auth)) => {
                    deps.hub.publish(Envelope::new(
                        Some(channel_id.clone()),
                        Payload::TrackError { item_id: item.id.clone(), reason: TrackErrorReason::Transport },
                    ));
                    if let Err(err) = deps.session.report_auth_error(&channel.account_id).await {
                        warn!(channel_id = %channel_id, error = %err, "failed to report auth error to session manager");
                    }
                    state = WorkerState::Error;
                    emit_state(&deps.hub, &channel_id, state);
                    break 'outer;
                }
                Ok(DriveOutcome::TransportError(TransportErrorKind::Transient)) => {
                    attempt += 1;
                    if attempt > transient_retry_attempts {
                        deps.hub.publish(Envelope::new(
                            Some(channel_id.clone()),
                            Payload::TrackError { item_id: item.id.clone(), reason: TrackErrorReason::Transport },
                        ));
                        let _ = deps.queue.skip(&channel_id).await;
                        break 'attempt;
                    }
                    let backoff = if attempt == 1 { Duration::from_secs(1) } else { Duration::from_secs(5) };
                    debug!(channel_id = %channel_id, attempt, "transient transport error, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    continue 'attempt;
                }
                Ok(DriveOutcome::TransportError(TransportErrorKind::Persistent)) | Err(_) => {
                    deps.hub.publish(Envelope::new(
                        Some(channel_id.clone()),
                        Payload::TrackError { item_id: item.id.clone(), reason: TrackErrorReason::Transport },
                    ));
                    let _ = deps.queue.skip(&channel_id).await;
                    break 'attempt;
                }
            }
        }
    }

    state = WorkerState::Stopping;
    emit_state(&deps.hub, &channel_id, state);
    if tokio::time::timeout(graceful_stop, deps.transport.leave(&channel_id)).await.is_err() {
        warn!(channel_id = %channel_id, "transport leave exceeded graceful stop window");
    }
    deps.autoend.cancel(&channel_id);
    deps.metrics.stream_stopped();
    state = WorkerState::Stopped;
    emit_state(&deps.hub, &channel_id, state);
    info!(channel_id = %channel_id, "worker stopped");
}

fn apply_config(deps: &WorkerDeps, channel_id: &str, settings: &mut PlaybackSettings, mut next: PlaybackSettings) {
    if next.clamp() {
        deps.hub.publish(Envelope::new(
            Some(channel_id.to_string()),
            Payload::SystemAlert {
                level: crate::events::AlertLevel::Warning,
                code: "playback_settings_clamped".to_string(),
                message: "speed/pitch out of range, clamped to bounds".to_string(),
            },
        ));
    }
    *settings = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Source, SourceKind};
    use crate::shared_store::InMemorySharedStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct NullSourceResolver;
    #[async_trait]
    impl SourceResolver for NullSourceResolver {
        async fn resolve(&self, item: &crate::domain::PlaylistItem) -> crate::error::Result<ResolvedSource> {
            Ok(ResolvedSource { uri: item.source.value.clone(), container_hint: None })
        }
    }

    struct NativeClassifier;
    impl CodecClassifier for NativeClassifier {
        fn classify(&self, _resolved: &ResolvedSource) -> CodecProfile {
            CodecProfile { name: "opus".to_string(), compatibility: CodecCompatibility::Native }
        }
    }

    struct NoopTranscoder;
    impl TranscodeStage for NoopTranscoder {
        fn plan(&self, profile: &CodecProfile, _encoder_params: &str) -> TranscodeDecision {
            TranscodeDecision { required: false, effective_profile: profile.name.clone() }
        }
    }

    /// Completes every drive call instantly with `NaturalEnd`, counting calls.
    struct PlaceholderTransport {
        drives: AtomicU32,
        joined: AsyncMutex<bool>,
    }

    impl PlaceholderTransport {
        fn new() -> Self {
            Self { drives: AtomicU32::new(0), joined: AsyncMutex::new(false) }
        }
    }

    #[async_trait]
    impl VoiceChatTransport for PlaceholderTransport {
        async fn join(&self, _channel_id: &str) -> crate::error::Result<()> {
            *self.joined.lock().await = true;
            Ok(())
        }

        async fn leave(&self, _channel_id: &str) -> crate::error::Result<()> {
            *self.joined.lock().await = false;
            Ok(())
        }

        async fn drive(
            &self,
            _channel_id: &str,
            _resolved: &ResolvedSource,
            _settings: &PlaybackSettings,
            _listener_tx: mpsc::UnboundedSender<u64>,
            _intents: &mut mpsc::Receiver<WorkerIntent>,
        ) -> crate::error::Result<DriveOutcome> {
            self.drives.fetch_add(1, Ordering::SeqCst);
            Ok(DriveOutcome::NaturalEnd)
        }
    }

    fn channel() -> Channel {
        Channel {
            id: "ch-1".to_string(),
            account_id: "acc-1".to_string(),
            target_chat_id: "-100123".to_string(),
            display_name: "Lobby".to_string(),
            stream_kind: crate::domain::StreamKind::Audio,
            encoder_params: String::new(),
            placeholder_media_ref: None,
            desired_state: crate::domain::DesiredState::Running,
            observed_state: crate::domain::ObservedState::Starting,
        }
    }

    fn test_deps(queue: Arc<QueueEngine>, transport: Arc<dyn VoiceChatTransport>) -> WorkerDeps {
        let metrics = Arc::new(MetricsCollector::new());
        let hub = Arc::new(EventHub::new(metrics.clone()));
        let store = Arc::new(InMemorySharedStore::new());

        struct NoopStopper;
        #[async_trait]
        impl crate::autoend::AutoEndStopper for NoopStopper {
            async fn request_stop(&self, _channel_id: &str, _reason: &str) -> crate::error::Result<()> {
                Ok(())
            }
        }
        let autoend = Arc::new(AutoEndController::new(
            store.clone(),
            hub.clone(),
            metrics.clone(),
            Arc::new(NoopStopper),
            &Config::default(),
        ));

        struct AlwaysValidValidator;
        #[async_trait]
        impl crate::session::CredentialValidator for AlwaysValidValidator {
            async fn validate(&self, _material: &crate::domain::SessionMaterial) -> crate::error::Result<bool> {
                Ok(true)
            }
        }
        struct InMemoryAccounts;
        #[async_trait]
        impl crate::session::AccountStore for InMemoryAccounts {
            async fn load(&self, account_id: &str) -> crate::error::Result<crate::domain::Account> {
                Ok(crate::domain::Account::new(
                    account_id,
                    "principal-1",
                    "Ops",
                    crate::domain::SessionMaterial::new("tok"),
                ))
            }
            async fn save_state(&self, _account_id: &str, _state: crate::domain::AccountState) -> crate::error::Result<()> {
                Ok(())
            }
        }
        let session = Arc::new(SessionManager::new(
            Arc::new(InMemoryAccounts),
            Arc::new(AlwaysValidValidator),
            hub.clone(),
            &Config::default(),
        ));

        WorkerDeps {
            queue,
            hub,
            metrics,
            autoend,
            session,
            resolver: Arc::new(NullSourceResolver),
            classifier: Arc::new(NativeClassifier),
            transcoder: Arc::new(NoopTranscoder),
            transport,
        }
    }

    #[tokio::test]
    async fn plays_items_in_fifo_order_then_idles_on_placeholder() {
        let store = Arc::new(InMemorySharedStore::new());
        let metrics = Arc::new(MetricsCollector::new());
        let hub = Arc::new(EventHub::new(metrics.clone()));
        let queue = Arc::new(QueueEngine::new(store, metrics, hub, 100));
        queue
            .add(
                "ch-1",
                crate::domain::PlaylistItem::new(
                    "a",
                    "ch-1",
                    Source { kind: SourceKind::WebUrl, value: "https://example.org/a.mp3".into() },
                ),
                None,
            )
            .await
            .unwrap();

        let transport = Arc::new(PlaceholderTransport::new());
        let deps = test_deps(queue.clone(), transport.clone());
        let (handle, _join) = spawn(channel(), deps, &Config::default());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(transport.drives.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn playback_settings_clamp_detects_out_of_range() {
        let mut settings = PlaybackSettings { speed: 5.0, pitch_semitones: 99, eq_bands: [0.0; 10] };
        assert!(settings.clamp());
        assert_eq!(settings.speed, 2.0);
        assert_eq!(settings.pitch_semitones, 12);
    }

    #[test]
    fn worker_state_cannot_skip_stopping() {
        assert!(!WorkerState::Running.can_transition_to(WorkerState::Stopped));
        assert!(WorkerState::Running.can_transition_to(WorkerState::Stopping));
    }
}
