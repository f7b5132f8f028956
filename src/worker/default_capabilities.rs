//! Default capability implementations (spec.md §9's "integration seam" note).
//!
//! `worker::traits` defines the boundary the streaming worker drives against;
//! nothing in this crate knows how to actually speak a voice-chat wire protocol or
//! decode real media. These are the honest defaults that let the rest of the system
//! — queueing, scheduling, auto-end, the facade — run end to end without one:
//! `LocalFileResolver` resolves what it can read from disk and passes everything
//! else through untouched, `NativeCodecClassifier`/`PassthroughTranscoder` never
//! claim a transcode is needed, and `SimulatedTransport` times a "drive" call out
//! against the item's declared duration rather than actually streaming audio.
//!
//! A real deployment replaces `SimulatedTransport` with something that talks to an
//! actual voice chat backend; everything upstream of `WorkerDeps` is unaffected.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::PlaylistItem;
use crate::error::Result;
use crate::worker::{
    CodecClassifier, CodecCompatibility, CodecProfile, DriveOutcome, PlaybackSettings, ResolvedSource,
    SourceResolver, TranscodeDecision, TranscodeStage, TransportErrorKind, VoiceChatTransport, WorkerIntent,
};

/// Resolves `local_path` items by checking the file exists and is readable;
/// everything else (`web_url`, `radio_stream`) passes the URI through as-is, since
/// this crate carries no HTTP client dependency to pre-fetch or probe with.
pub struct DefaultSourceResolver;

#[async_trait]
impl SourceResolver for DefaultSourceResolver {
    async fn resolve(&self, item: &PlaylistItem) -> Result<ResolvedSource> {
        use crate::domain::SourceKind;
        match item.source.kind {
            SourceKind::LocalPath => {
                tokio::fs::metadata(&item.source.value)
                    .await
                    .map_err(|err| crate::error::Error::validation(format!("local source unreadable: {err}")))?;
                Ok(ResolvedSource { uri: item.source.value.clone(), container_hint: None })
            }
            SourceKind::WebUrl | SourceKind::RadioStream => {
                Ok(ResolvedSource { uri: item.source.value.clone(), container_hint: None })
            }
        }
    }
}

/// Classifies every resolved source as a single native profile. A deployment that
/// actually probes container/codec metadata replaces this with something that
/// inspects `ResolvedSource::container_hint`.
pub struct NativeCodecClassifier;

impl CodecClassifier for NativeCodecClassifier {
    fn classify(&self, _resolved: &ResolvedSource) -> CodecProfile {
        CodecProfile { name: "native".to_string(), compatibility: CodecCompatibility::Native }
    }
}

/// Never requires a transcode; passes the classified profile through unchanged.
pub struct PassthroughTranscoder;

impl TranscodeStage for PassthroughTranscoder {
    fn plan(&self, profile: &CodecProfile, _encoder_params: &str) -> TranscodeDecision {
        TranscodeDecision { required: false, effective_profile: profile.name.clone() }
    }
}

const LISTENER_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Used for sources with no declared duration (radio streams, live sources): drive
/// runs until an intent ends it rather than timing out.
const UNBOUNDED_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Times out a "drive" call against the playlist item's declared duration instead
/// of actually decoding and transmitting media, while still honoring every
/// `WorkerIntent` the worker's own loop hands it mid-playback. This is the seam a
/// real transport implementation takes over; everything above it (queueing,
/// skip/seek semantics, auto-end, retries) is exercised identically either way.
pub struct SimulatedTransport {
    duration: Option<Duration>,
}

impl SimulatedTransport {
    pub fn new(duration_seconds: Option<u32>) -> Self {
        Self { duration: duration_seconds.map(|s| Duration::from_secs(s as u64)) }
    }
}

#[async_trait]
impl VoiceChatTransport for SimulatedTransport {
    async fn join(&self, channel_id: &str) -> Result<()> {
        debug!(channel_id, "simulated transport joined");
        Ok(())
    }

    async fn leave(&self, channel_id: &str) -> Result<()> {
        debug!(channel_id, "simulated transport left");
        Ok(())
    }

    async fn drive(
        &self,
        _channel_id: &str,
        _resolved: &ResolvedSource,
        settings: &PlaybackSettings,
        listener_tx: mpsc::UnboundedSender<u64>,
        intents: &mut mpsc::Receiver<WorkerIntent>,
    ) -> Result<DriveOutcome> {
        let speed = settings.speed.max(0.1) as f64;
        let effective_duration = self.duration.map(|d| Duration::from_secs_f64(d.as_secs_f64() / speed));
        let deadline = effective_duration.map(|d| Instant::now() + d);
        let mut paused = false;
        let mut position = Duration::ZERO;
        let mut last_tick = Instant::now();

        loop {
            let poll_in = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(UNBOUNDED_POLL_INTERVAL)
                .min(LISTENER_POLL_INTERVAL);

            tokio::select! {
                _ = tokio::time::sleep(poll_in) => {
                    if !paused {
                        position += last_tick.elapsed();
                    }
                    last_tick = Instant::now();
                    let _ = listener_tx.send(1);
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(DriveOutcome::NaturalEnd);
                        }
                    }
                }
                intent = intents.recv() => {
                    match intent {
                        Some(WorkerIntent::Stop) => return Ok(DriveOutcome::Stopped),
                        Some(WorkerIntent::Skip) => return Ok(DriveOutcome::Skipped),
                        Some(WorkerIntent::Seek(seconds)) => {
                            position = Duration::from_secs(seconds);
                            last_tick = Instant::now();
                        }
                        Some(WorkerIntent::Pause) => {
                            position += last_tick.elapsed();
                            paused = true;
                        }
                        Some(WorkerIntent::Resume) => {
                            paused = false;
                            last_tick = Instant::now();
                        }
                        Some(WorkerIntent::ConfigUpdate(_)) => {
                            // Speed changes mid-drive are not retroactively applied to the
                            // remaining deadline in this simulated transport; a real transport
                            // recomputes pacing from its actual decoder position instead.
                        }
                        None => return Ok(DriveOutcome::Stopped),
                    }
                }
            }
        }
    }

    fn supports_seek(&self) -> bool {
        true
    }
}

/// Classifies I/O errors surfaced while attempting to reach a source as
/// `transient` vs `persistent`, for callers that need to decide retry policy
/// outside the worker's own `drive` loop (the worker itself only ever sees
/// `TransportErrorKind` via `DriveOutcome::TransportError`, never this directly).
pub fn classify_io_error(err: &std::io::Error) -> TransportErrorKind {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied => TransportErrorKind::Auth,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => TransportErrorKind::Transient,
        _ => TransportErrorKind::Persistent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Source, SourceKind};

    fn item(kind: SourceKind, value: &str) -> PlaylistItem {
        PlaylistItem::new("item-1", "ch-1", Source { kind, value: value.to_string() })
    }

    #[tokio::test]
    async fn resolves_web_url_passthrough() {
        let resolver = DefaultSourceResolver;
        let resolved = resolver.resolve(&item(SourceKind::WebUrl, "https://example.org/a.mp3")).await.unwrap();
        assert_eq!(resolved.uri, "https://example.org/a.mp3");
    }

    #[tokio::test]
    async fn local_path_rejects_missing_file() {
        let resolver = DefaultSourceResolver;
        let err = resolver.resolve(&item(SourceKind::LocalPath, "/no/such/file-xyz")).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn classifier_always_native() {
        let profile = NativeCodecClassifier.classify(&ResolvedSource { uri: "x".into(), container_hint: None });
        assert_eq!(profile.compatibility, CodecCompatibility::Native);
    }

    #[test]
    fn transcoder_never_required() {
        let profile = CodecProfile { name: "native".to_string(), compatibility: CodecCompatibility::Native };
        let decision = PassthroughTranscoder.plan(&profile, "");
        assert!(!decision.required);
    }

    #[tokio::test(start_paused = true)]
    async fn drive_ends_naturally_after_declared_duration() {
        let transport = SimulatedTransport::new(Some(1));
        let (listener_tx, _listener_rx) = mpsc::unbounded_channel();
        let (_intent_tx, mut intent_rx) = mpsc::channel(8);
        let resolved = ResolvedSource { uri: "x".into(), container_hint: None };
        let settings = PlaybackSettings::default();

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            transport.drive("ch-1", &resolved, &settings, listener_tx, &mut intent_rx),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(outcome, DriveOutcome::NaturalEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn drive_honors_stop_intent_mid_playback() {
        let transport = SimulatedTransport::new(Some(600));
        let (listener_tx, _listener_rx) = mpsc::unbounded_channel();
        let (intent_tx, mut intent_rx) = mpsc::channel(8);
        let resolved = ResolvedSource { uri: "x".into(), container_hint: None };
        let settings = PlaybackSettings::default();

        intent_tx.send(WorkerIntent::Stop).await.unwrap();
        let outcome = transport.drive("ch-1", &resolved, &settings, listener_tx, &mut intent_rx).await.unwrap();
        assert!(matches!(outcome, DriveOutcome::Stopped));
    }
}
