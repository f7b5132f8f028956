//! Channel row model — persists [`crate::domain::Channel`].

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub id: String,
    pub account_id: String,
    pub target_chat_id: String,
    pub display_name: String,
    pub stream_kind: String,
    pub encoder_params: String,
    pub placeholder_media_ref: Option<String>,
    pub desired_state: String,
    pub observed_state: String,
}
