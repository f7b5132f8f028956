//! PlaylistItem row model — persists [`crate::domain::PlaylistItem`].

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct PlaylistItemRow {
    pub id: String,
    pub channel_id: String,
    pub source_kind: String,
    pub source_value: String,
    pub title: Option<String>,
    pub duration_seconds: Option<i64>,
    pub thumbnail: Option<String>,
    pub computed_codec_profile: Option<String>,
    pub status: String,
    pub requester_principal_id: Option<String>,
    pub requester_role: Option<String>,
    pub created_at_ms: i64,
}
