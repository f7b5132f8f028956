//! Service Facade (spec.md §6.1): the single entry point an external HTTP/UI
//! surface calls into. Every method takes the calling [`Principal`], runs it
//! through C1 admission, then a closed authorization table, then delegates to the
//! owning component and records an [`AuditEvent`]. Per spec.md §1 this module
//! defines no HTTP routes, request parsing, or OpenAPI surface — those are an
//! external collaborator's job.

use std::sync::Arc;

use tracing::warn;

use crate::api::error::{FacadeError, FacadeResult};
use crate::database::repositories::{
    SqlxAccountRepository, SqlxAuditEventRepository, SqlxChannelRepository, SqlxPlaylistItemRepository,
    SqlxSchedulerTriggerRepository,
};
use crate::domain::{
    Account, AuditEvent, AuditEventFilter, AuditOutcome, Channel, FireSchedule, PlaylistItem, PriorityRole,
    Principal, Recurrence, Role, SchedulerTrigger, SessionMaterial,
};
use crate::metrics::{HealthSummary, MetricsCollector};
use crate::process::ProcessController;
use crate::queue::{Discipline, MutationOutcome, QueueEngine};
use crate::rate_limiter::RateLimiter;
use crate::session::SessionManager;

const ADMISSION_BUCKET: &str = "standard";

/// The Service Facade (spec.md §6.1).
pub struct ApiFacade {
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<QueueEngine>,
    session: Arc<SessionManager>,
    process: Arc<ProcessController>,
    metrics: Arc<MetricsCollector>,
    accounts: Arc<SqlxAccountRepository>,
    channels: Arc<SqlxChannelRepository>,
    triggers: Arc<SqlxSchedulerTriggerRepository>,
    playlist_items: Arc<SqlxPlaylistItemRepository>,
    audit: Arc<SqlxAuditEventRepository>,
}

impl ApiFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        queue: Arc<QueueEngine>,
        session: Arc<SessionManager>,
        process: Arc<ProcessController>,
        metrics: Arc<MetricsCollector>,
        accounts: Arc<SqlxAccountRepository>,
        channels: Arc<SqlxChannelRepository>,
        triggers: Arc<SqlxSchedulerTriggerRepository>,
        playlist_items: Arc<SqlxPlaylistItemRepository>,
        audit: Arc<SqlxAuditEventRepository>,
    ) -> Self {
        Self { rate_limiter, queue, session, process, metrics, accounts, channels, triggers, playlist_items, audit }
    }

    async fn admit(&self, principal: &Principal) -> FacadeResult<()> {
        let admission = self.rate_limiter.admit(&principal.id, ADMISSION_BUCKET).await;
        if !admission.allowed {
            return Err(FacadeError::from(crate::error::Error::RateLimited { reset_after_ms: admission.reset_after_ms }));
        }
        Ok(())
    }

    async fn record(&self, principal: &Principal, action: &str, channel_id: Option<String>, outcome: AuditOutcome, detail: impl Into<String>) {
        let event = AuditEvent::new(
            uuid::Uuid::new_v4().to_string(),
            principal.id.clone(),
            format!("{:?}", principal.role),
            action,
            channel_id,
            outcome,
            detail,
        );
        if let Err(err) = self.audit.insert(&event).await {
            warn!(action, error = %err, "failed to record audit event");
        }
    }

    /// Runs a channel-scoped operation: admits, authorizes (optionally checking
    /// channel ownership for `operator`), audits the outcome, and returns whatever
    /// the operation itself returns.
    async fn guarded<T, F, Fut>(
        &self,
        principal: &Principal,
        action: &str,
        channel_id: Option<&str>,
        allowed: fn(Role) -> bool,
        operation: F,
    ) -> FacadeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<T>>,
    {
        if let Err(err) = self.admit(principal).await {
            self.record(principal, action, channel_id.map(str::to_string), AuditOutcome::Denied, "rate_limited").await;
            return Err(err);
        }

        if !allowed(principal.role) {
            self.record(principal, action, channel_id.map(str::to_string), AuditOutcome::Denied, "role not authorized").await;
            return Err(FacadeError::forbidden(format!("{:?} may not call {action}", principal.role)));
        }

        match operation().await {
            Ok(value) => {
                self.record(principal, action, channel_id.map(str::to_string), AuditOutcome::Ok, "").await;
                Ok(value)
            }
            Err(err) => {
                self.record(principal, action, channel_id.map(str::to_string), AuditOutcome::Error, err.to_string()).await;
                Err(err.into())
            }
        }
    }

    /// Operator is restricted to channels owned by their own principal (spec.md
    /// §6.1: "operator limited to start/stop/restart on their channels"); every
    /// other authorized role may act on any channel.
    async fn authorize_channel_owner(&self, principal: &Principal, channel_id: &str) -> FacadeResult<()> {
        if principal.role != Role::Operator {
            return Ok(());
        }
        let channel = <SqlxChannelRepository as crate::process::ChannelStore>::load(&self.channels, channel_id).await?;
        let account = self.accounts.list().await?.into_iter().find(|a| a.id == channel.account_id);
        match account {
            Some(account) if account.owner_principal_id == principal.id => Ok(()),
            _ => Err(FacadeError::forbidden("operator does not own this channel")),
        }
    }

    // ---- Queue Engine (C3) ----

    pub async fn add_to_queue(
        &self,
        principal: Principal,
        channel_id: &str,
        item: PlaylistItem,
        requester_role: Option<PriorityRole>,
    ) -> FacadeResult<usize> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "add_to_queue", Some(channel_id), |_| true, move || async move {
            queue.add(&channel_id_owned, item, requester_role).await
        })
        .await
    }

    pub async fn priority_add(&self, principal: Principal, channel_id: &str, item: PlaylistItem) -> FacadeResult<usize> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "priority_add", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            queue.priority_add(&channel_id_owned, item).await
        })
        .await
    }

    pub async fn remove_from_queue(&self, principal: Principal, channel_id: &str, item_id: &str) -> FacadeResult<MutationOutcome> {
        let queue = self.queue.clone();
        let (channel_id_owned, item_id_owned) = (channel_id.to_string(), item_id.to_string());
        self.guarded(&principal, "remove_from_queue", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            queue.remove(&channel_id_owned, &item_id_owned).await
        })
        .await
    }

    pub async fn move_in_queue(
        &self,
        principal: Principal,
        channel_id: &str,
        item_id: &str,
        new_position: usize,
    ) -> FacadeResult<MutationOutcome> {
        let queue = self.queue.clone();
        let (channel_id_owned, item_id_owned) = (channel_id.to_string(), item_id.to_string());
        self.guarded(&principal, "move_in_queue", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            queue.move_item(&channel_id_owned, &item_id_owned, new_position).await
        })
        .await
    }

    pub async fn skip(&self, principal: Principal, channel_id: &str) -> FacadeResult<Option<PlaylistItem>> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "skip", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            queue.skip(&channel_id_owned).await
        })
        .await
    }

    pub async fn peek(&self, principal: Principal, channel_id: &str) -> FacadeResult<Option<PlaylistItem>> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "peek", Some(channel_id), |_| true, move || async move { queue.peek(&channel_id_owned).await })
            .await
    }

    pub async fn snapshot(&self, principal: Principal, channel_id: &str) -> FacadeResult<Vec<PlaylistItem>> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "snapshot", Some(channel_id), |_| true, move || async move {
            queue.snapshot(&channel_id_owned).await
        })
        .await
    }

    pub async fn set_discipline(&self, principal: Principal, channel_id: &str, discipline: Discipline) -> FacadeResult<()> {
        let queue = self.queue.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "set_discipline", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            queue.set_discipline(&channel_id_owned, discipline).await
        })
        .await
    }

    pub async fn migrate_queue(&self, principal: Principal, from_channel: &str, to_channel: &str) -> FacadeResult<usize> {
        let queue = self.queue.clone();
        let (from, to) = (from_channel.to_string(), to_channel.to_string());
        self.guarded(&principal, "migrate_queue", Some(from_channel), Role::is_admin_or_above_or_moderator, move || async move {
            queue.migrate(&from, &to).await
        })
        .await
    }

    // ---- Process Controller (C7/C8) ----

    pub async fn start_channel(&self, principal: Principal, channel_id: &str) -> FacadeResult<()> {
        self.authorize_channel_owner(&principal, channel_id).await?;
        let process = self.process.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "start_channel", Some(channel_id), Role::is_operator_or_above, move || async move {
            process.start(&channel_id_owned).await
        })
        .await
    }

    pub async fn stop_channel(&self, principal: Principal, channel_id: &str) -> FacadeResult<()> {
        self.authorize_channel_owner(&principal, channel_id).await?;
        let process = self.process.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "stop_channel", Some(channel_id), Role::is_operator_or_above, move || async move {
            process.stop(&channel_id_owned).await
        })
        .await
    }

    pub async fn restart_channel(&self, principal: Principal, channel_id: &str) -> FacadeResult<()> {
        self.authorize_channel_owner(&principal, channel_id).await?;
        let process = self.process.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "restart_channel", Some(channel_id), Role::is_operator_or_above, move || async move {
            process.restart(&channel_id_owned).await
        })
        .await
    }

    /// `GetChannelStatus(channel_id)` (spec.md §6.1) — a read, open to every role.
    pub async fn get_channel_status(&self, principal: Principal, channel_id: &str) -> FacadeResult<HealthSummary> {
        self.admit(&principal).await?;
        self.process.health_summary(channel_id, &self.metrics).await.map_err(FacadeError::from)
    }

    // ---- Session Lifecycle Manager (C4) ----

    pub async fn revoke_account(&self, principal: Principal, account_id: &str) -> FacadeResult<()> {
        let session = self.session.clone();
        let account_id_owned = account_id.to_string();
        self.guarded(&principal, "revoke_account", None, |r| r.is_admin_or_above(), move || async move {
            session.revoke(&account_id_owned).await
        })
        .await
    }

    pub async fn replace_session_material(&self, principal: Principal, account_id: &str, material: SessionMaterial) -> FacadeResult<()> {
        let accounts = self.accounts.clone();
        let session = self.session.clone();
        let account_id_owned = account_id.to_string();
        let account_id_for_invalidate = account_id.to_string();
        self.guarded(&principal, "replace_session_material", None, |r| r.is_admin_or_above(), move || async move {
            accounts.replace_session_material(&account_id_owned, &material).await?;
            session.invalidate_cache(&account_id_for_invalidate);
            Ok(())
        })
        .await
    }

    // ---- Administrative CRUD (accounts/channels; spec.md §6.1's admin tier) ----

    pub async fn create_account(&self, principal: Principal, account: Account) -> FacadeResult<()> {
        let accounts = self.accounts.clone();
        self.guarded(&principal, "create_account", None, |r| r.is_admin_or_above(), move || async move { accounts.create(&account).await })
            .await
    }

    pub async fn create_channel(&self, principal: Principal, channel: Channel) -> FacadeResult<()> {
        let channels = self.channels.clone();
        self.guarded(&principal, "create_channel", None, |r| r.is_admin_or_above(), move || async move { channels.create(&channel).await })
            .await
    }

    pub async fn list_channels(&self, principal: Principal) -> FacadeResult<Vec<Channel>> {
        let channels = self.channels.clone();
        self.guarded(&principal, "list_channels", None, Role::is_admin_or_above_or_moderator, move || async move {
            channels.list().await
        })
        .await
    }

    pub async fn delete_channel(&self, principal: Principal, channel_id: &str) -> FacadeResult<()> {
        let channels = self.channels.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "delete_channel", Some(channel_id), |r| r.is_admin_or_above(), move || async move {
            channels.delete(&channel_id_owned).await
        })
        .await
    }

    // ---- Scheduler (C9) trigger management ----

    pub async fn create_trigger(
        &self,
        principal: Principal,
        channel_id: &str,
        playlist_ref: &str,
        schedule: FireSchedule,
        recurrence: Recurrence,
    ) -> FacadeResult<SchedulerTrigger> {
        let triggers = self.triggers.clone();
        let (channel_id_owned, playlist_ref_owned) = (channel_id.to_string(), playlist_ref.to_string());
        self.guarded(&principal, "create_trigger", Some(channel_id), |r| r.is_admin_or_above(), move || async move {
            let trigger = SchedulerTrigger::new(uuid::Uuid::new_v4().to_string(), channel_id_owned, playlist_ref_owned, schedule, recurrence);
            triggers.create(&trigger).await?;
            Ok(trigger)
        })
        .await
    }

    pub async fn list_triggers(&self, principal: Principal, channel_id: &str) -> FacadeResult<Vec<SchedulerTrigger>> {
        let triggers = self.triggers.clone();
        let channel_id_owned = channel_id.to_string();
        self.guarded(&principal, "list_triggers", Some(channel_id), Role::is_admin_or_above_or_moderator, move || async move {
            triggers.list_for_channel(&channel_id_owned).await
        })
        .await
    }

    pub async fn delete_trigger(&self, principal: Principal, trigger_id: &str) -> FacadeResult<()> {
        let triggers = self.triggers.clone();
        let trigger_id_owned = trigger_id.to_string();
        self.guarded(&principal, "delete_trigger", None, |r| r.is_admin_or_above(), move || async move {
            triggers.delete(&trigger_id_owned).await
        })
        .await
    }

    /// Resolves a scheduler trigger's `playlist_ref` to a concrete item, exposed so
    /// callers building an admin UI for triggers can preview what will play.
    pub async fn load_playlist_item(&self, principal: Principal, playlist_ref: &str) -> FacadeResult<PlaylistItem> {
        let playlist_items = self.playlist_items.clone();
        let playlist_ref_owned = playlist_ref.to_string();
        self.guarded(&principal, "load_playlist_item", None, Role::is_admin_or_above_or_moderator, move || async move {
            playlist_items.load(&playlist_ref_owned).await
        })
        .await
    }

    // ---- Audit ----

    /// `ListAuditEvents(filter)` (spec.md §6.1).
    pub async fn list_audit_events(&self, principal: Principal, filter: AuditEventFilter) -> FacadeResult<Vec<AuditEvent>> {
        let audit = self.audit.clone();
        let channel_id = filter.channel_id.clone();
        self.guarded(&principal, "list_audit_events", channel_id.as_deref(), Role::is_admin_or_above_or_moderator, move || async move {
            audit.list(&filter).await
        })
        .await
    }
}

/// Closed authorization table additions (spec.md §6.1) that don't fit `Role`'s own
/// `is_admin_or_above`.
trait RoleAuthz {
    fn is_admin_or_above_or_moderator(self) -> bool;
    fn is_operator_or_above(self) -> bool;
}

impl RoleAuthz for Role {
    fn is_admin_or_above_or_moderator(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin | Role::SuperAdmin)
    }

    fn is_operator_or_above(self) -> bool {
        matches!(self, Role::Operator | Role::Moderator | Role::Admin | Role::SuperAdmin)
    }
}
