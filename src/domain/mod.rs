//! Domain entities (spec §3).

pub mod account;
pub mod audit;
pub mod channel;
pub mod playlist_item;
pub mod role;
pub mod scheduler_trigger;
pub mod session_material;
pub mod worker_record;

pub use account::{Account, AccountState};
pub use audit::{AuditEvent, AuditEventFilter, AuditOutcome};
pub use channel::{Channel, DesiredState, ObservedState, StreamKind};
pub use playlist_item::{ItemStatus, PlaylistItem, Source, SourceKind};
pub use role::{Principal, PriorityRole, Role};
pub use scheduler_trigger::{FireSchedule, Recurrence, SchedulerTrigger};
pub use session_material::SessionMaterial;
pub use worker_record::{WorkerLifecycle, WorkerRecord, MAX_LAST_ERROR_LEN};
