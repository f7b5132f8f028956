//! AuditEvent entity (SPEC_FULL §3) — written exclusively by the Service Facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Ok,
    Denied,
    Error,
}

/// Bounded-length detail string; never contains `session_material` (the facade only
/// ever writes plain operation parameters here, which exclude secrets by type).
const MAX_DETAIL_LEN: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_principal_id: String,
    pub actor_role: String,
    pub action: String,
    pub channel_id: Option<String>,
    pub outcome: AuditOutcome,
    pub detail: String,
}

impl AuditEvent {
    pub fn new(
        id: impl Into<String>,
        actor_principal_id: impl Into<String>,
        actor_role: impl Into<String>,
        action: impl Into<String>,
        channel_id: Option<String>,
        outcome: AuditOutcome,
        detail: impl Into<String>,
    ) -> Self {
        let mut detail = detail.into();
        detail.truncate(MAX_DETAIL_LEN);
        Self {
            id: id.into(),
            occurred_at: Utc::now(),
            actor_principal_id: actor_principal_id.into(),
            actor_role: actor_role.into(),
            action: action.into(),
            channel_id,
            outcome,
            detail,
        }
    }
}

/// Filter for `ListAuditEvents` (spec §6.1).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditEventFilter {
    pub channel_id: Option<String>,
    pub actor_principal_id: Option<String>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
