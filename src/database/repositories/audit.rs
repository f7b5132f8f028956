//! `AuditEvent` persistence (SPEC_FULL §3) — append-only, written exclusively by
//! the Service Facade. `list` implements `ListAuditEvents(filter)` (spec §6.1).

use crate::database::DbPool;
use crate::database::models::AuditEventRow;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{AuditEvent, AuditEventFilter, AuditOutcome};
use crate::error::{Error, Result};

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

pub struct SqlxAuditEventRepository {
    pool: DbPool,
}

impl SqlxAuditEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &AuditEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_events (id, occurred_at_ms, actor_principal_id, actor_role, action, channel_id, outcome, detail)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(datetime_to_ms(event.occurred_at))
        .bind(&event.actor_principal_id)
        .bind(&event.actor_role)
        .bind(&event.action)
        .bind(&event.channel_id)
        .bind(outcome_label(event.outcome))
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self, filter: &AuditEventFilter) -> Result<Vec<AuditEvent>> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0);

        let mut query = String::from("SELECT * FROM audit_events WHERE 1 = 1");
        if filter.channel_id.is_some() {
            query.push_str(" AND channel_id = ?");
        }
        if filter.actor_principal_id.is_some() {
            query.push_str(" AND actor_principal_id = ?");
        }
        if filter.action.is_some() {
            query.push_str(" AND action = ?");
        }
        if filter.since.is_some() {
            query.push_str(" AND occurred_at_ms >= ?");
        }
        if filter.until.is_some() {
            query.push_str(" AND occurred_at_ms <= ?");
        }
        query.push_str(" ORDER BY occurred_at_ms DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, AuditEventRow>(&query);
        if let Some(channel_id) = &filter.channel_id {
            q = q.bind(channel_id);
        }
        if let Some(actor) = &filter.actor_principal_id {
            q = q.bind(actor);
        }
        if let Some(action) = &filter.action {
            q = q.bind(action);
        }
        if let Some(since) = filter.since {
            q = q.bind(datetime_to_ms(since));
        }
        if let Some(until) = filter.until {
            q = q.bind(datetime_to_ms(until));
        }
        q = q.bind(limit as i64).bind(offset as i64);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_event).collect()
    }
}

fn outcome_label(outcome: AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Ok => "ok",
        AuditOutcome::Denied => "denied",
        AuditOutcome::Error => "error",
    }
}

fn parse_outcome(raw: &str) -> Result<AuditOutcome> {
    match raw {
        "ok" => Ok(AuditOutcome::Ok),
        "denied" => Ok(AuditOutcome::Denied),
        "error" => Ok(AuditOutcome::Error),
        other => Err(Error::internal(format!("unknown audit outcome in storage: {other}"))),
    }
}

fn row_to_event(row: AuditEventRow) -> Result<AuditEvent> {
    Ok(AuditEvent {
        id: row.id,
        occurred_at: ms_to_datetime(row.occurred_at_ms),
        actor_principal_id: row.actor_principal_id,
        actor_role: row.actor_role,
        action: row.action,
        channel_id: row.channel_id,
        outcome: parse_outcome(&row.outcome)?,
        detail: row.detail,
    })
}
