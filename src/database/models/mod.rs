//! Row models — the `sqlx::FromRow` shapes persisted tables are read into, kept
//! separate from the domain entities in [`crate::domain`] so storage concerns
//! (ciphertext columns, string-encoded enums, epoch-millisecond timestamps) never
//! leak into domain logic.

pub mod account;
pub mod audit;
pub mod channel;
pub mod playlist_item;
pub mod scheduler_trigger;
pub mod worker_record;

pub use account::AccountRow;
pub use audit::AuditEventRow;
pub use channel::ChannelRow;
pub use playlist_item::PlaylistItemRow;
pub use scheduler_trigger::SchedulerTriggerRow;
pub use worker_record::WorkerRecordRow;
