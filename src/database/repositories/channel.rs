//! `Channel` and `WorkerRecord` persistence. Implements [`crate::process::ChannelStore`]
//! for the Process Controller; also exposes channel CRUD for the Service Facade.

use async_trait::async_trait;

use crate::database::DbPool;
use crate::database::models::{ChannelRow, WorkerRecordRow};
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Channel, DesiredState, ObservedState, StreamKind, WorkerLifecycle, WorkerRecord};
use crate::error::{Error, Result};
use crate::process::ChannelStore;
use crate::scheduler::DesiredStateStore;

pub struct SqlxChannelRepository {
    pool: DbPool,
}

impl SqlxChannelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            "INSERT INTO channels (id, account_id, target_chat_id, display_name, stream_kind, encoder_params, placeholder_media_ref, desired_state, observed_state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&channel.id)
        .bind(&channel.account_id)
        .bind(&channel.target_chat_id)
        .bind(&channel.display_name)
        .bind(stream_kind_label(channel.stream_kind))
        .bind(&channel.encoder_params)
        .bind(&channel.placeholder_media_ref)
        .bind(desired_state_label(channel.desired_state))
        .bind(observed_state_label(channel.observed_state))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = sqlx::query_as("SELECT * FROM channels ORDER BY id").fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_channel).collect()
    }

    pub async fn set_desired_state(&self, channel_id: &str, state: DesiredState) -> Result<()> {
        let result = sqlx::query("UPDATE channels SET desired_state = ? WHERE id = ?")
            .bind(desired_state_label(state))
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Channel", channel_id));
        }
        Ok(())
    }

    pub async fn delete(&self, channel_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Channel", channel_id));
        }
        Ok(())
    }
}

fn row_to_channel(row: ChannelRow) -> Result<Channel> {
    Ok(Channel {
        id: row.id,
        account_id: row.account_id,
        target_chat_id: row.target_chat_id,
        display_name: row.display_name,
        stream_kind: parse_stream_kind(&row.stream_kind)?,
        encoder_params: row.encoder_params,
        placeholder_media_ref: row.placeholder_media_ref,
        desired_state: parse_desired_state(&row.desired_state)?,
        observed_state: parse_observed_state(&row.observed_state)?,
    })
}

fn stream_kind_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Audio => "audio",
        StreamKind::Video => "video",
    }
}

fn parse_stream_kind(raw: &str) -> Result<StreamKind> {
    match raw {
        "audio" => Ok(StreamKind::Audio),
        "video" => Ok(StreamKind::Video),
        other => Err(Error::internal(format!("unknown stream_kind in storage: {other}"))),
    }
}

fn desired_state_label(state: DesiredState) -> &'static str {
    match state {
        DesiredState::Running => "running",
        DesiredState::Stopped => "stopped",
    }
}

fn parse_desired_state(raw: &str) -> Result<DesiredState> {
    match raw {
        "running" => Ok(DesiredState::Running),
        "stopped" => Ok(DesiredState::Stopped),
        other => Err(Error::internal(format!("unknown desired_state in storage: {other}"))),
    }
}

fn observed_state_label(state: ObservedState) -> &'static str {
    match state {
        ObservedState::Stopped => "stopped",
        ObservedState::Starting => "starting",
        ObservedState::Running => "running",
        ObservedState::Stopping => "stopping",
        ObservedState::Error => "error",
        ObservedState::Unknown => "unknown",
    }
}

fn parse_observed_state(raw: &str) -> Result<ObservedState> {
    match raw {
        "stopped" => Ok(ObservedState::Stopped),
        "starting" => Ok(ObservedState::Starting),
        "running" => Ok(ObservedState::Running),
        "stopping" => Ok(ObservedState::Stopping),
        "error" => Ok(ObservedState::Error),
        "unknown" => Ok(ObservedState::Unknown),
        other => Err(Error::internal(format!("unknown observed_state in storage: {other}"))),
    }
}

fn lifecycle_label(lifecycle: WorkerLifecycle) -> &'static str {
    match lifecycle {
        WorkerLifecycle::Starting => "starting",
        WorkerLifecycle::Running => "running",
        WorkerLifecycle::Stopping => "stopping",
        WorkerLifecycle::Stopped => "stopped",
        WorkerLifecycle::Failed => "failed",
    }
}

fn parse_lifecycle(raw: &str) -> Result<WorkerLifecycle> {
    match raw {
        "starting" => Ok(WorkerLifecycle::Starting),
        "running" => Ok(WorkerLifecycle::Running),
        "stopping" => Ok(WorkerLifecycle::Stopping),
        "stopped" => Ok(WorkerLifecycle::Stopped),
        "failed" => Ok(WorkerLifecycle::Failed),
        other => Err(Error::internal(format!("unknown worker lifecycle in storage: {other}"))),
    }
}

fn row_to_worker_record(row: WorkerRecordRow) -> Result<WorkerRecord> {
    Ok(WorkerRecord {
        channel_id: row.channel_id,
        handle: row.handle,
        started_at: row.started_at_ms.map(ms_to_datetime),
        lifecycle: parse_lifecycle(&row.lifecycle)?,
        last_error: row.last_error,
        restart_attempts: row.restart_attempts as u32,
        next_restart_at: row.next_restart_at_ms.map(ms_to_datetime),
    })
}

#[async_trait]
impl ChannelStore for SqlxChannelRepository {
    async fn load(&self, channel_id: &str) -> Result<Channel> {
        let row: Option<ChannelRow> = sqlx::query_as("SELECT * FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| Error::not_found("Channel", channel_id))?;
        row_to_channel(row)
    }

    async fn list_desired_running(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = sqlx::query_as("SELECT * FROM channels WHERE desired_state = 'running' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_channel).collect()
    }

    async fn set_observed_state(&self, channel_id: &str, state: ObservedState) -> Result<()> {
        let result = sqlx::query("UPDATE channels SET observed_state = ? WHERE id = ?")
            .bind(observed_state_label(state))
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Channel", channel_id));
        }
        Ok(())
    }

    async fn load_worker_record(&self, channel_id: &str) -> Result<WorkerRecord> {
        let row: Option<WorkerRecordRow> = sqlx::query_as("SELECT * FROM worker_records WHERE channel_id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_worker_record(row),
            None => Ok(WorkerRecord::new(channel_id)),
        }
    }

    async fn save_worker_record(&self, record: &WorkerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_records (channel_id, handle, started_at_ms, lifecycle, last_error, restart_attempts, next_restart_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id) DO UPDATE SET
                handle = excluded.handle,
                started_at_ms = excluded.started_at_ms,
                lifecycle = excluded.lifecycle,
                last_error = excluded.last_error,
                restart_attempts = excluded.restart_attempts,
                next_restart_at_ms = excluded.next_restart_at_ms",
        )
        .bind(&record.channel_id)
        .bind(&record.handle)
        .bind(record.started_at.map(datetime_to_ms))
        .bind(lifecycle_label(record.lifecycle))
        .bind(&record.last_error)
        .bind(record.restart_attempts as i64)
        .bind(record.next_restart_at.map(datetime_to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// The Scheduler (C9) only needs to read a channel's current state and flip its
/// `desired_state` — both already implemented for the facade/process controller
/// above, so this just delegates rather than duplicating the queries.
#[async_trait]
impl DesiredStateStore for SqlxChannelRepository {
    async fn load(&self, channel_id: &str) -> Result<Channel> {
        <Self as ChannelStore>::load(self, channel_id).await
    }

    async fn set_desired_state(&self, channel_id: &str, state: DesiredState) -> Result<()> {
        SqlxChannelRepository::set_desired_state(self, channel_id, state).await
    }
}

