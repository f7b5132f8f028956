//! PlaylistItem entity (spec §3, §4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::role::PriorityRole;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    WebUrl,
    LocalPath,
    RadioStream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub value: String,
}

impl Source {
    /// Syntactic-only validation (spec §4.3): `web_url`/`radio_stream` must parse as
    /// absolute http(s) URLs; `local_path` must be a non-empty path string. Semantic
    /// reachability is the worker's problem at play time.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            SourceKind::WebUrl | SourceKind::RadioStream => {
                let url = Url::parse(&self.value).map_err(|_| Error::invalid_url())?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(Error::invalid_url());
                }
                Ok(())
            }
            SourceKind::LocalPath => {
                if self.value.trim().is_empty() {
                    Err(Error::invalid_url())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Playing,
    Played,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub id: String,
    pub channel_id: String,
    pub source: Source,
    pub title: Option<String>,
    pub duration_seconds: Option<u32>,
    pub thumbnail: Option<String>,
    pub computed_codec_profile: Option<String>,
    pub status: ItemStatus,
    pub requester_principal_id: Option<String>,
    pub requester_role: Option<PriorityRole>,
    pub created_at: DateTime<Utc>,
}

impl PlaylistItem {
    pub fn new(id: impl Into<String>, channel_id: impl Into<String>, source: Source) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            source,
            title: None,
            duration_seconds: None,
            thumbnail: None,
            computed_codec_profile: None,
            status: ItemStatus::Queued,
            requester_principal_id: None,
            requester_role: None,
            created_at: Utc::now(),
        }
    }

    /// `score = role_base + timestamp / SCALE`. `SCALE` is large enough that the
    /// fractional timestamp term never reaches 1000, so role always dominates and
    /// time only breaks ties within a role (spec §4.3).
    pub fn priority_score(&self) -> f64 {
        const SCALE: f64 = 1_000_000_000.0;
        let role_base = self
            .requester_role
            .unwrap_or(PriorityRole::User)
            .role_base() as f64;
        role_base + (self.created_at.timestamp_millis() as f64 / SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_web_url() {
        let s = Source { kind: SourceKind::WebUrl, value: "rtmp://example.com/live".into() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn accepts_https_web_url() {
        let s = Source { kind: SourceKind::WebUrl, value: "https://example.org/a.mp3".into() };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn local_path_rejects_empty() {
        let s = Source { kind: SourceKind::LocalPath, value: "   ".into() };
        assert!(s.validate().is_err());
    }

    #[test]
    fn vip_scores_lower_than_admin() {
        let mut vip = PlaylistItem::new("1", "ch", Source { kind: SourceKind::LocalPath, value: "/a".into() });
        vip.requester_role = Some(PriorityRole::Vip);
        let mut admin = PlaylistItem::new("2", "ch", Source { kind: SourceKind::LocalPath, value: "/b".into() });
        admin.requester_role = Some(PriorityRole::Admin);
        assert!(vip.priority_score() < admin.priority_score());
    }
}
