//! WorkerRecord row model — persists [`crate::domain::WorkerRecord`].

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct WorkerRecordRow {
    pub channel_id: String,
    pub handle: Option<String>,
    pub started_at_ms: Option<i64>,
    pub lifecycle: String,
    pub last_error: Option<String>,
    pub restart_attempts: i64,
    pub next_restart_at_ms: Option<i64>,
}
