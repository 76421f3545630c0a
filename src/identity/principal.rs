use serde::{Deserialize, Serialize};

use crate::model::{Role, User};

/// The signed-in user a request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
}

impl Principal {
    pub fn from_user(user: &User) -> Self {
        Self { user_id: user.id.clone(), role: user.role, name: Some(user.display_name().to_string()) }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins act for anyone; everyone else only for themselves.
    pub fn may_act_for(&self, user_id: &str) -> bool {
        self.is_admin() || self.user_id == user_id
    }
}
