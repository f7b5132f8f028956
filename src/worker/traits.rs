//! Pipeline capability traits (spec.md §4.7.2) — the Streaming Worker drives these
//! but never depends on a concrete media-transport or decoding implementation.
//! Grounded on the teacher's `downloader/engine/traits.rs` `Extractor`/`Downloader`
//! capability-trait shape, re-keyed from "extract a stream from a platform" to
//! "resolve/classify/transcode/transport a playlist item".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::PlaylistItem;
use crate::error::Result;

/// What the source resolver hands back: an opaque handle the transport stage can
/// drive, plus whatever codec hint the resolution step could determine up front.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub uri: String,
    pub container_hint: Option<String>,
}

/// Given a `PlaylistItem`, produces a readable media stream (spec.md §4.7.2 stage 1).
/// Concrete implementations: direct local file, direct HTTP(S) radio stream, or a
/// pluggable external-fetcher capability for `web_url` items.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, item: &PlaylistItem) -> Result<ResolvedSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecCompatibility {
    Native,
    RequiresTranscode,
}

#[derive(Debug, Clone)]
pub struct CodecProfile {
    pub name: String,
    pub compatibility: CodecCompatibility,
}

/// Inspects a resolved stream and produces a `codec_profile` (spec.md §4.7.2 stage 2).
pub trait CodecClassifier: Send + Sync {
    fn classify(&self, resolved: &ResolvedSource) -> CodecProfile;
}

#[derive(Debug, Clone)]
pub struct TranscodeDecision {
    pub required: bool,
    pub effective_profile: String,
}

/// Plans a transcode when the classifier reports `RequiresTranscode` (spec.md §4.7.2
/// stage 3). An invalid `encoder_params` string falls back to a safe default profile
/// rather than rejecting playback.
pub trait TranscodeStage: Send + Sync {
    fn plan(&self, profile: &CodecProfile, encoder_params: &str) -> TranscodeDecision;
}

/// Runtime playback intent: speed/pitch/EQ (spec.md §4.7.3). Held only in the
/// worker's memory, never persisted (spec.md §9 Open Question resolved this way).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    pub speed: f32,
    pub pitch_semitones: i32,
    pub eq_bands: [f32; 10],
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self { speed: 1.0, pitch_semitones: 0, eq_bands: [0.0; 10] }
    }
}

impl PlaybackSettings {
    /// Clamps out-of-range values per spec.md §4.7.3 and reports whether anything
    /// was actually clamped (callers emit a warning event when `true`).
    pub fn clamp(&mut self) -> bool {
        let mut clamped = false;
        let speed = self.speed.clamp(0.5, 2.0);
        if (speed - self.speed).abs() > f32::EPSILON {
            clamped = true;
        }
        self.speed = speed;

        let pitch = self.pitch_semitones.clamp(-12, 12);
        if pitch != self.pitch_semitones {
            clamped = true;
        }
        self.pitch_semitones = pitch;

        clamped
    }
}

/// Outcome of driving the transport stage to a stopping point (spec.md §4.7.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    NaturalEnd,
    Skipped,
    Stopped,
    TransportError(TransportErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Auth,
    Transient,
    Persistent,
}

/// Hands the (possibly transcoded) stream to the voice-chat transport and drives it
/// to completion (spec.md §4.7.2 stages 4-5). `listener_tx` carries participant-count
/// observer callbacks (stage 5) back to the worker, which forwards them to C6.
#[async_trait]
pub trait VoiceChatTransport: Send + Sync {
    async fn join(&self, channel_id: &str) -> Result<()>;
    async fn leave(&self, channel_id: &str) -> Result<()>;

    async fn drive(
        &self,
        channel_id: &str,
        resolved: &ResolvedSource,
        settings: &PlaybackSettings,
        listener_tx: tokio::sync::mpsc::UnboundedSender<u64>,
        intents: &mut tokio::sync::mpsc::Receiver<super::WorkerIntent>,
    ) -> Result<DriveOutcome>;

    /// Whether the currently playing source supports repositioning (spec.md §4.7.3's
    /// seek contract: unsupported resolvers reject with `not_seekable`).
    fn supports_seek(&self) -> bool {
        false
    }
}
