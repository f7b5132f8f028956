//! WorkerRecord entity (spec §3, §4.8) — owned by the Process Controller (C8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerLifecycle {
    pub fn can_transition_to(&self, next: WorkerLifecycle) -> bool {
        use WorkerLifecycle::*;
        matches!(
            (*self, next),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }
}

/// The length bound spec §3 places on `last_error`.
pub const MAX_LAST_ERROR_LEN: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub channel_id: String,
    /// Opaque handle into whatever the `Supervisor` capability uses to name this
    /// worker (a PID, a container id, or — for `TaskSupervisor` — a task's own name).
    pub handle: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub lifecycle: WorkerLifecycle,
    pub last_error: Option<String>,
    pub restart_attempts: u32,
    pub next_restart_at: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            handle: None,
            started_at: None,
            lifecycle: WorkerLifecycle::Stopped,
            last_error: None,
            restart_attempts: 0,
            next_restart_at: None,
        }
    }

    pub fn transition_to(&mut self, next: WorkerLifecycle) -> Result<()> {
        if !self.lifecycle.can_transition_to(next) {
            return Err(Error::invalid_transition(
                "WorkerRecord.lifecycle",
                format!("{:?}", self.lifecycle),
                format!("{:?}", next),
            ));
        }
        self.lifecycle = next;
        Ok(())
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        let mut reason = reason.into();
        reason.truncate(MAX_LAST_ERROR_LEN);
        self.last_error = Some(reason);
        self.restart_attempts += 1;
    }

    pub fn reset_restart_counter(&mut self) {
        self.restart_attempts = 0;
        self.next_restart_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        let mut w = WorkerRecord::new("ch-1");
        w.transition_to(WorkerLifecycle::Starting).unwrap();
        w.transition_to(WorkerLifecycle::Running).unwrap();
        w.transition_to(WorkerLifecycle::Stopping).unwrap();
        w.transition_to(WorkerLifecycle::Stopped).unwrap();
    }

    #[test]
    fn cannot_skip_stopping() {
        let mut w = WorkerRecord::new("ch-1");
        w.transition_to(WorkerLifecycle::Starting).unwrap();
        w.transition_to(WorkerLifecycle::Running).unwrap();
        assert!(w.transition_to(WorkerLifecycle::Stopped).is_err());
    }

    #[test]
    fn last_error_is_bounded() {
        let mut w = WorkerRecord::new("ch-1");
        w.record_failure("x".repeat(5000));
        assert_eq!(w.last_error.unwrap().len(), MAX_LAST_ERROR_LEN);
        assert_eq!(w.restart_attempts, 1);
    }
}
