//! Session Lifecycle Manager (C4, spec.md §4.4).
//!
//! Drives the Account state machine (`active → degraded → {active, revoked}`),
//! spawning a cancellable recovery task per degraded account. Grounded on the
//! teacher's `credentials/manager.rs`: a `CredentialStatus`-style trait boundary
//! (`validate`) between this module and whatever concrete transport exists, and the
//! same "recovery never re-authenticates interactively" boundary the teacher's
//! `CredentialManager::validate` draws between status checks and refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{Account, AccountState, SessionMaterial};
use crate::error::{Error, Result};
use crate::events::{AlertLevel, Envelope, EventHub, Payload};

/// The one capability the recovery task needs from the (external) transport: a
/// non-interactive "is this still good" check. Concrete transports implement this
/// alongside `worker::VoiceChatTransport`; this module only depends on the trait.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, material: &SessionMaterial) -> Result<bool>;
}

/// Abstraction over the Account repository so this module does not depend on sqlx
/// directly; `database::repositories::SqlxAccountRepository` implements it.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Account>;
    async fn save_state(&self, account_id: &str, state: AccountState) -> Result<()>;
}

struct RecoveryTask {
    handle: JoinHandle<()>,
}

impl Drop for RecoveryTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Session Lifecycle Manager (C4).
pub struct SessionManager {
    store: Arc<dyn AccountStore>,
    validator: Arc<dyn CredentialValidator>,
    hub: Arc<EventHub>,
    recovery_initial: Duration,
    recovery_max: Duration,
    give_up_after_attempts: u32,
    recovery_tasks: Arc<DashMap<String, RecoveryTask>>,
    cached_states: Arc<DashMap<String, AccountState>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        validator: Arc<dyn CredentialValidator>,
        hub: Arc<EventHub>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            validator,
            hub,
            recovery_initial: Duration::from_secs(config.session_recovery_initial_seconds),
            recovery_max: Duration::from_secs(config.session_recovery_max_seconds),
            give_up_after_attempts: config.session_recovery_give_up_after_attempts,
            recovery_tasks: Arc::new(DashMap::new()),
            cached_states: Arc::new(DashMap::new()),
        }
    }

    /// Called by C8/worker bootstrap before admitting a start request: degraded and
    /// revoked accounts refuse with `session_unavailable` (spec.md §4.4 guarantee),
    /// and the session_material itself is never read on this path.
    pub async fn is_account_startable(&self, account_id: &str) -> Result<bool> {
        Ok(self.current_state(account_id).await? == AccountState::Active)
    }

    async fn current_state(&self, account_id: &str) -> Result<AccountState> {
        if let Some(state) = self.cached_states.get(account_id) {
            return Ok(*state);
        }
        let account = self.store.load(account_id).await?;
        self.cached_states.insert(account_id.to_string(), account.state);
        Ok(account.state)
    }

    /// Triggered when a worker's transport layer reports an `auth_error`
    /// classification. Moves the account to `degraded`, emits a `system_alert`, and
    /// spawns the recovery task. Idempotent: a second call while already degraded
    /// does not spawn a duplicate task.
    pub async fn report_auth_error(&self, account_id: &str) -> Result<()> {
        let mut account = self.store.load(account_id).await?;
        if account.state == AccountState::Degraded {
            return Ok(());
        }
        account.transition_to(AccountState::Degraded)?;
        self.store.save_state(account_id, AccountState::Degraded).await?;
        self.cached_states.insert(account_id.to_string(), AccountState::Degraded);

        self.hub.publish(Envelope::new(
            None,
            Payload::SystemAlert {
                level: AlertLevel::Warning,
                code: "session_degraded".to_string(),
                message: format!("account {account_id} session degraded, recovery in progress"),
            },
        ));
        info!(account_id, "account entered degraded state, spawning recovery task");
        self.spawn_recovery_task(account_id.to_string());
        Ok(())
    }

    /// `revoked` is terminal; only the operator-authorized credential-replacement
    /// path (outside this module) clears it by constructing a brand-new Account row.
    pub async fn revoke(&self, account_id: &str) -> Result<()> {
        let mut account = self.store.load(account_id).await?;
        account.transition_to(AccountState::Revoked)?;
        self.store.save_state(account_id, AccountState::Revoked).await?;
        self.cached_states.insert(account_id.to_string(), AccountState::Revoked);
        self.recovery_tasks.remove(account_id);
        self.hub.publish(Envelope::new(
            None,
            Payload::SystemAlert {
                level: AlertLevel::Error,
                code: "session_revoked".to_string(),
                message: format!("account {account_id} session revoked"),
            },
        ));
        Ok(())
    }

    /// Called after an operator replaces `session_material` out-of-band: clears the
    /// cached state so the next `is_account_startable` re-reads from the store.
    pub fn invalidate_cache(&self, account_id: &str) {
        self.cached_states.remove(account_id);
        self.recovery_tasks.remove(account_id);
    }

    fn spawn_recovery_task(&self, account_id: String) {
        if self.recovery_tasks.contains_key(&account_id) {
            return;
        }
        let store = self.store.clone();
        let validator = self.validator.clone();
        let hub = self.hub.clone();
        let cached_states = self.cached_states.clone();
        let recovery_tasks = self.recovery_tasks.clone();
        let initial = self.recovery_initial;
        let max = self.recovery_max;
        let give_up_after = self.give_up_after_attempts;

        let id_for_task = account_id.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = initial;
            let mut attempts_at_cap = 0u32;

            loop {
                tokio::time::sleep(backoff).await;

                let account = match store.load(&id_for_task).await {
                    Ok(account) => account,
                    Err(err) => {
                        warn!(account_id = %id_for_task, error = %err, "recovery task failed to load account, retrying");
                        continue;
                    }
                };
                if account.state != AccountState::Degraded {
                    // Someone else already moved this account (revoked out-of-band, etc).
                    break;
                }

                match validator.validate(&account.session_material).await {
                    Ok(true) => {
                        if store.save_state(&id_for_task, AccountState::Active).await.is_ok() {
                            cached_states.insert(id_for_task.clone(), AccountState::Active);
                            info!(account_id = %id_for_task, "recovery succeeded, account active again");
                            hub.publish(Envelope::new(
                                None,
                                Payload::SystemAlert {
                                    level: AlertLevel::Info,
                                    code: "session_recovered".to_string(),
                                    message: format!("account {id_for_task} session recovered"),
                                },
                            ));
                        }
                        break;
                    }
                    Ok(false) | Err(_) => {
                        if backoff >= max {
                            attempts_at_cap += 1;
                            if attempts_at_cap >= give_up_after {
                                if store.save_state(&id_for_task, AccountState::Revoked).await.is_ok() {
                                    cached_states.insert(id_for_task.clone(), AccountState::Revoked);
                                }
                                warn!(account_id = %id_for_task, "recovery exhausted, account revoked");
                                hub.publish(Envelope::new(
                                    None,
                                    Payload::SystemAlert {
                                        level: AlertLevel::Error,
                                        code: "session_recovery_exhausted".to_string(),
                                        message: format!("account {id_for_task} recovery exhausted, revoked"),
                                    },
                                ));
                                break;
                            }
                        } else {
                            backoff = (backoff * 2).min(max);
                        }
                    }
                }
            }

            recovery_tasks.remove(&id_for_task);
        });

        self.recovery_tasks.insert(account_id, RecoveryTask { handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use std::collections::HashMap;
    use tokio::sync::Mutex as AsyncMutex;

    struct InMemoryAccountStore {
        accounts: AsyncMutex<HashMap<String, Account>>,
    }

    #[async_trait]
    impl AccountStore for InMemoryAccountStore {
        async fn load(&self, account_id: &str) -> Result<Account> {
            self.accounts
                .lock()
                .await
                .get(account_id)
                .cloned()
                .ok_or_else(|| Error::not_found("Account", account_id))
        }

        async fn save_state(&self, account_id: &str, state: AccountState) -> Result<()> {
            if let Some(account) = self.accounts.lock().await.get_mut(account_id) {
                account.state = state;
            }
            Ok(())
        }
    }

    struct AlwaysValid;
    #[async_trait]
    impl CredentialValidator for AlwaysValid {
        async fn validate(&self, _material: &SessionMaterial) -> Result<bool> {
            Ok(true)
        }
    }

    struct AlwaysInvalid;
    #[async_trait]
    impl CredentialValidator for AlwaysInvalid {
        async fn validate(&self, _material: &SessionMaterial) -> Result<bool> {
            Ok(false)
        }
    }

    fn account() -> Account {
        Account::new("acc-1", "principal-1", "Ops", SessionMaterial::new("tok"))
    }

    fn manager(validator: Arc<dyn CredentialValidator>) -> (SessionManager, Arc<InMemoryAccountStore>) {
        let mut accounts = HashMap::new();
        accounts.insert("acc-1".to_string(), account());
        let store = Arc::new(InMemoryAccountStore { accounts: AsyncMutex::new(accounts) });
        let mut config = Config::default();
        config.session_recovery_initial_seconds = 0;
        config.session_recovery_max_seconds = 0;
        let manager = SessionManager::new(
            store.clone(),
            validator,
            Arc::new(EventHub::new(Arc::new(MetricsCollector::new()))),
            &config,
        );
        (manager, store)
    }

    #[tokio::test]
    async fn report_auth_error_moves_to_degraded_and_refuses_start() {
        let (manager, _store) = manager(Arc::new(AlwaysValid));
        assert!(manager.is_account_startable("acc-1").await.unwrap());
        manager.report_auth_error("acc-1").await.unwrap();
        assert!(!manager.is_account_startable("acc-1").await.unwrap());
    }

    #[tokio::test]
    async fn recovery_succeeds_and_returns_to_active() {
        let (manager, store) = manager(Arc::new(AlwaysValid));
        manager.report_auth_error("acc-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let account = store.load("acc-1").await.unwrap();
        assert_eq!(account.state, AccountState::Active);
    }

    #[tokio::test]
    async fn revoke_is_terminal_and_cancels_recovery() {
        let (manager, store) = manager(Arc::new(AlwaysInvalid));
        manager.report_auth_error("acc-1").await.unwrap();
        manager.revoke("acc-1").await.unwrap();
        let account = store.load("acc-1").await.unwrap();
        assert_eq!(account.state, AccountState::Revoked);
        assert!(!manager.is_account_startable("acc-1").await.unwrap());
    }
}
