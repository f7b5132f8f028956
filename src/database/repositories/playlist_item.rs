//! `PlaylistItem` persistence. The Queue Engine itself (C3) is entirely
//! `SharedStore`-backed per spec.md §4.3/§6.4 — this repository exists for the
//! facade's durable item lookups (e.g. resolving a scheduler `playlist_ref`) that
//! fall outside the live queue's scope.

use crate::database::DbPool;
use crate::database::models::PlaylistItemRow;
use crate::database::time::datetime_to_ms;
use crate::domain::{ItemStatus, PlaylistItem, PriorityRole, Source, SourceKind};
use crate::error::{Error, Result};

pub struct SqlxPlaylistItemRepository {
    pool: DbPool,
}

impl SqlxPlaylistItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, item: &PlaylistItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO playlist_items (id, channel_id, source_kind, source_value, title, duration_seconds, thumbnail, computed_codec_profile, status, requester_principal_id, requester_role, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.channel_id)
        .bind(source_kind_label(item.source.kind))
        .bind(&item.source.value)
        .bind(&item.title)
        .bind(item.duration_seconds.map(|d| d as i64))
        .bind(&item.thumbnail)
        .bind(&item.computed_codec_profile)
        .bind(item_status_label(item.status))
        .bind(&item.requester_principal_id)
        .bind(item.requester_role.map(priority_role_label))
        .bind(datetime_to_ms(item.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, item_id: &str) -> Result<PlaylistItem> {
        let row: Option<PlaylistItemRow> = sqlx::query_as("SELECT * FROM playlist_items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| Error::not_found("PlaylistItem", item_id))?;
        row_to_item(row)
    }

    pub async fn list_for_channel(&self, channel_id: &str) -> Result<Vec<PlaylistItem>> {
        let rows: Vec<PlaylistItemRow> = sqlx::query_as("SELECT * FROM playlist_items WHERE channel_id = ? ORDER BY created_at_ms")
            .bind(channel_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_item).collect()
    }

    pub async fn set_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        let result = sqlx::query("UPDATE playlist_items SET status = ? WHERE id = ?")
            .bind(item_status_label(status))
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("PlaylistItem", item_id));
        }
        Ok(())
    }
}

fn row_to_item(row: PlaylistItemRow) -> Result<PlaylistItem> {
    Ok(PlaylistItem {
        id: row.id,
        channel_id: row.channel_id,
        source: Source { kind: parse_source_kind(&row.source_kind)?, value: row.source_value },
        title: row.title,
        duration_seconds: row.duration_seconds.map(|d| d as u32),
        thumbnail: row.thumbnail,
        computed_codec_profile: row.computed_codec_profile,
        status: parse_item_status(&row.status)?,
        requester_principal_id: row.requester_principal_id,
        requester_role: row.requester_role.map(|r| parse_priority_role(&r)).transpose()?,
        created_at: crate::database::time::ms_to_datetime(row.created_at_ms),
    })
}

fn source_kind_label(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::WebUrl => "web_url",
        SourceKind::LocalPath => "local_path",
        SourceKind::RadioStream => "radio_stream",
    }
}

fn parse_source_kind(raw: &str) -> Result<SourceKind> {
    match raw {
        "web_url" => Ok(SourceKind::WebUrl),
        "local_path" => Ok(SourceKind::LocalPath),
        "radio_stream" => Ok(SourceKind::RadioStream),
        other => Err(Error::internal(format!("unknown source_kind in storage: {other}"))),
    }
}

fn item_status_label(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Queued => "queued",
        ItemStatus::Playing => "playing",
        ItemStatus::Played => "played",
        ItemStatus::Failed => "failed",
        ItemStatus::Skipped => "skipped",
    }
}

fn parse_item_status(raw: &str) -> Result<ItemStatus> {
    match raw {
        "queued" => Ok(ItemStatus::Queued),
        "playing" => Ok(ItemStatus::Playing),
        "played" => Ok(ItemStatus::Played),
        "failed" => Ok(ItemStatus::Failed),
        "skipped" => Ok(ItemStatus::Skipped),
        other => Err(Error::internal(format!("unknown item status in storage: {other}"))),
    }
}

fn priority_role_label(role: PriorityRole) -> &'static str {
    match role {
        PriorityRole::Vip => "vip",
        PriorityRole::Admin => "admin",
        PriorityRole::User => "user",
    }
}

fn parse_priority_role(raw: &str) -> Result<PriorityRole> {
    match raw {
        "vip" => Ok(PriorityRole::Vip),
        "admin" => Ok(PriorityRole::Admin),
        "user" => Ok(PriorityRole::User),
        other => Err(Error::internal(format!("unknown priority role in storage: {other}"))),
    }
}
