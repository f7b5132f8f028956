//! SchedulerTrigger entity (spec §3, §4.9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A trigger fires either on a recurring cron schedule or once at a wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireSchedule {
    Cron { expression: String, timezone: String },
    WallTime { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Once,
    Recurring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTrigger {
    pub id: String,
    pub channel_id: String,
    pub playlist_ref: String,
    pub schedule: FireSchedule,
    pub recurrence: Recurrence,
    pub enabled: bool,
}

impl SchedulerTrigger {
    pub fn new(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        playlist_ref: impl Into<String>,
        schedule: FireSchedule,
        recurrence: Recurrence,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            playlist_ref: playlist_ref.into(),
            schedule,
            recurrence,
            enabled: true,
        }
    }
}
