//! Principal roles and the priority-discipline role tiers.
//!
//! These are two distinct taxonomies: `Role` gates *which operations* a caller may
//! invoke (spec §6.1's authorization table); `PriorityRole` only affects *queue
//! ordering* under the priority discipline (§4.3). A `superadmin` caller's own
//! playlist adds still carry whatever `PriorityRole` their request declares.

use serde::{Deserialize, Serialize};

/// Authorization role attached to every request's principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Operator,
    Moderator,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin_or_above(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

/// The identity attached to a request by the (external) authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

/// Coarse tier used only to compute priority-discipline scores (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityRole {
    Vip,
    Admin,
    User,
}

impl PriorityRole {
    /// `score = role_base + timestamp / SCALE`; lower wins.
    pub const fn role_base(&self) -> i64 {
        match self {
            PriorityRole::Vip => 0,
            PriorityRole::Admin => 1000,
            PriorityRole::User => 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vip_outranks_admin_outranks_user() {
        assert!(PriorityRole::Vip.role_base() < PriorityRole::Admin.role_base());
        assert!(PriorityRole::Admin.role_base() < PriorityRole::User.role_base());
    }
}
