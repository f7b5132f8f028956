//! `SchedulerTrigger` persistence for the Scheduler (C9).

use std::sync::Arc;

use async_trait::async_trait;

use crate::database::DbPool;
use crate::database::models::SchedulerTriggerRow;
use crate::database::time::ms_to_datetime;
use crate::domain::{FireSchedule, PlaylistItem, Recurrence, SchedulerTrigger};
use crate::error::{Error, Result};
use crate::scheduler::TriggerStore;

use super::playlist_item::SqlxPlaylistItemRepository;

pub struct SqlxSchedulerTriggerRepository {
    pool: DbPool,
    playlist_items: Arc<SqlxPlaylistItemRepository>,
}

impl SqlxSchedulerTriggerRepository {
    pub fn new(pool: DbPool, playlist_items: Arc<SqlxPlaylistItemRepository>) -> Self {
        Self { pool, playlist_items }
    }

    pub async fn create(&self, trigger: &SchedulerTrigger) -> Result<()> {
        let (kind, cron_expression, cron_timezone, wall_time_ms) = schedule_columns(&trigger.schedule);
        sqlx::query(
            "INSERT INTO scheduler_triggers (id, channel_id, playlist_ref, schedule_kind, cron_expression, cron_timezone, wall_time_ms, recurrence, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trigger.id)
        .bind(&trigger.channel_id)
        .bind(&trigger.playlist_ref)
        .bind(kind)
        .bind(cron_expression)
        .bind(cron_timezone)
        .bind(wall_time_ms)
        .bind(recurrence_label(trigger.recurrence))
        .bind(trigger.enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, trigger_id: &str) -> Result<SchedulerTrigger> {
        let row: Option<SchedulerTriggerRow> = sqlx::query_as("SELECT * FROM scheduler_triggers WHERE id = ?")
            .bind(trigger_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| Error::not_found("SchedulerTrigger", trigger_id))?;
        row_to_trigger(row)
    }

    pub async fn list_enabled(&self) -> Result<Vec<SchedulerTrigger>> {
        let rows: Vec<SchedulerTriggerRow> = sqlx::query_as("SELECT * FROM scheduler_triggers WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_trigger).collect()
    }

    pub async fn list_for_channel(&self, channel_id: &str) -> Result<Vec<SchedulerTrigger>> {
        let rows: Vec<SchedulerTriggerRow> = sqlx::query_as("SELECT * FROM scheduler_triggers WHERE channel_id = ? ORDER BY id")
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_trigger).collect()
    }

    pub async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE scheduler_triggers SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("SchedulerTrigger", trigger_id));
        }
        Ok(())
    }

    pub async fn delete(&self, trigger_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM scheduler_triggers WHERE id = ?")
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("SchedulerTrigger", trigger_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TriggerStore for SqlxSchedulerTriggerRepository {
    async fn list_enabled(&self) -> Result<Vec<SchedulerTrigger>> {
        SqlxSchedulerTriggerRepository::list_enabled(self).await
    }

    async fn disable(&self, trigger_id: &str) -> Result<()> {
        self.set_enabled(trigger_id, false).await
    }

    async fn load_playlist_item(&self, playlist_ref: &str) -> Result<PlaylistItem> {
        self.playlist_items.load(playlist_ref).await
    }
}

fn schedule_columns(schedule: &FireSchedule) -> (&'static str, Option<String>, Option<String>, Option<i64>) {
    match schedule {
        FireSchedule::Cron { expression, timezone } => ("cron", Some(expression.clone()), Some(timezone.clone()), None),
        FireSchedule::WallTime { at } => ("wall_time", None, None, Some(crate::database::time::datetime_to_ms(*at))),
    }
}

fn row_to_trigger(row: SchedulerTriggerRow) -> Result<SchedulerTrigger> {
    let schedule = match row.schedule_kind.as_str() {
        "cron" => FireSchedule::Cron {
            expression: row.cron_expression.ok_or_else(|| Error::internal("cron trigger row missing cron_expression"))?,
            timezone: row.cron_timezone.ok_or_else(|| Error::internal("cron trigger row missing cron_timezone"))?,
        },
        "wall_time" => FireSchedule::WallTime {
            at: ms_to_datetime(row.wall_time_ms.ok_or_else(|| Error::internal("wall_time trigger row missing wall_time_ms"))?),
        },
        other => return Err(Error::internal(format!("unknown schedule_kind in storage: {other}"))),
    };
    Ok(SchedulerTrigger {
        id: row.id,
        channel_id: row.channel_id,
        playlist_ref: row.playlist_ref,
        schedule,
        recurrence: parse_recurrence(&row.recurrence)?,
        enabled: row.enabled,
    })
}

fn recurrence_label(recurrence: Recurrence) -> &'static str {
    match recurrence {
        Recurrence::Once => "once",
        Recurrence::Recurring => "recurring",
    }
}

fn parse_recurrence(raw: &str) -> Result<Recurrence> {
    match raw {
        "once" => Ok(Recurrence::Once),
        "recurring" => Ok(Recurrence::Recurring),
        other => Err(Error::internal(format!("unknown recurrence in storage: {other}"))),
    }
}
