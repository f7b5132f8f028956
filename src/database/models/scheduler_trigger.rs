//! SchedulerTrigger row model — persists [`crate::domain::SchedulerTrigger`].
//!
//! `FireSchedule`'s two variants are flattened into a `schedule_kind` discriminant
//! plus the union of both variants' fields, the same way the teacher flattens
//! sum-typed domain fields onto a single table rather than reaching for a joined
//! side table.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct SchedulerTriggerRow {
    pub id: String,
    pub channel_id: String,
    pub playlist_ref: String,
    pub schedule_kind: String,
    pub cron_expression: Option<String>,
    pub cron_timezone: Option<String>,
    pub wall_time_ms: Option<i64>,
    pub recurrence: String,
    pub enabled: bool,
}
