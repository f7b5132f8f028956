//! The host supervisor capability (spec.md §4.8/§9): "start/stop a named long-lived
//! process with restart-on-failure and resource isolation", exposed through
//! `Start`/`Stop`/`Status`. Grounded on the teacher's `scheduler/actor/supervisor.rs`
//! registry-of-handles shape, with `Start(name, args, env)` reinterpreted for a
//! single-binary deployment as "register the `AbortHandle` of a task that's already
//! running" rather than literally forking a process — spec.md §9's explicit
//! single-binary carve-out. The caller keeps the matching `JoinHandle` to await
//! completion (crash detection feeds `ProcessController::record_worker_exit`).

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::error::Result;

/// Mirrors spec.md §4.8's `Status(name) -> {active, activating, deactivating,
/// failed, inactive}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Active,
    Activating,
    Deactivating,
    Failed,
    Inactive,
}

/// Host supervisor capability boundary.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Registers the task backing a newly started named unit. Takes an `AbortHandle`
    /// (not the `JoinHandle` itself) so the caller can separately await the task's
    /// completion to detect crashes while the supervisor retains the ability to
    /// force-terminate it.
    async fn register(&self, name: &str, handle: AbortHandle);

    /// Forcefully terminates a named unit (spec.md §4.7.4: used only once the
    /// worker's own graceful-stop window has been exceeded).
    async fn terminate(&self, name: &str) -> Result<()>;

    async fn status(&self, name: &str) -> SupervisorStatus;

    async fn remove(&self, name: &str);
}

/// In-process `Supervisor`: runs each named unit as a tokio task rather than a
/// separate OS process (spec.md §9's single-binary resolution).
pub struct TaskSupervisor {
    units: Mutex<HashMap<String, AbortHandle>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self { units: Mutex::new(HashMap::new()) }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supervisor for TaskSupervisor {
    async fn register(&self, name: &str, handle: AbortHandle) {
        if let Some(previous) = self.units.lock().insert(name.to_string(), handle) {
            previous.abort();
        }
    }

    async fn terminate(&self, name: &str) -> Result<()> {
        if let Some(handle) = self.units.lock().remove(name) {
            handle.abort();
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> SupervisorStatus {
        match self.units.lock().get(name) {
            Some(handle) if handle.is_finished() => SupervisorStatus::Failed,
            Some(_) => SupervisorStatus::Active,
            None => SupervisorStatus::Inactive,
        }
    }

    async fn remove(&self, name: &str) {
        self.units.lock().remove(name);
    }
}
