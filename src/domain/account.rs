//! Account entity and its credential-validity state machine (spec §3, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session_material::SessionMaterial;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Active,
    Degraded,
    Revoked,
}

impl AccountState {
    /// See spec §4.4's diagram: active -[auth error]-> degraded, degraded -[recover]->
    /// active, degraded -[give up]-> revoked, active -[revoke]-> revoked. `revoked` is
    /// terminal.
    pub fn can_transition_to(&self, next: AccountState) -> bool {
        use AccountState::*;
        matches!(
            (*self, next),
            (Active, Degraded) | (Active, Revoked) | (Degraded, Active) | (Degraded, Revoked)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub owner_principal_id: String,
    pub display_label: String,
    pub session_material: SessionMaterial,
    pub state: AccountState,
    pub last_validated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        id: impl Into<String>,
        owner_principal_id: impl Into<String>,
        display_label: impl Into<String>,
        session_material: SessionMaterial,
    ) -> Self {
        Self {
            id: id.into(),
            owner_principal_id: owner_principal_id.into(),
            display_label: display_label.into(),
            session_material,
            state: AccountState::Active,
            last_validated_at: Utc::now(),
        }
    }

    /// Applies a validated state transition, or returns `InvalidStateTransition`.
    pub fn transition_to(&mut self, next: AccountState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                "Account",
                format!("{:?}", self.state),
                format!("{:?}", next),
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == AccountState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("acc-1", "principal-1", "Ops Account", SessionMaterial::new("tok"))
    }

    #[test]
    fn degrade_then_recover() {
        let mut a = account();
        a.transition_to(AccountState::Degraded).unwrap();
        assert_eq!(a.state, AccountState::Degraded);
        a.transition_to(AccountState::Active).unwrap();
        assert_eq!(a.state, AccountState::Active);
    }

    #[test]
    fn revoked_is_terminal() {
        let mut a = account();
        a.transition_to(AccountState::Revoked).unwrap();
        assert!(a.transition_to(AccountState::Active).is_err());
        assert!(a.transition_to(AccountState::Degraded).is_err());
    }
}
