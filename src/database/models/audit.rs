//! AuditEvent row model — persists [`crate::domain::AuditEvent`]. Append-only;
//! no repository method ever updates or deletes a row once written.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct AuditEventRow {
    pub id: String,
    pub occurred_at_ms: i64,
    pub actor_principal_id: String,
    pub actor_role: String,
    pub action: String,
    pub channel_id: Option<String>,
    pub outcome: String,
    pub detail: String,
}
