//! Domain rows held by the store and the collection names used for change tracking.

use serde::{Deserialize, Serialize};

/// Epoch milliseconds.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A domain entity set tracked for freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Weapons,
    WeaponTypes,
    Users,
}

impl Collection {
    /// Enumeration order used when several collections change in one tick.
    pub const ALL: [Collection; 3] = [Collection::Weapons, Collection::WeaponTypes, Collection::Users];

    /// Push channel name.
    pub fn channel(self) -> &'static str {
        match self {
            Collection::Weapons => "weapons",
            Collection::WeaponTypes => "weapon-types",
            Collection::Users => "users",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        Collection::ALL.into_iter().find(|c| c.channel() == channel)
    }

    /// Prefix of the event names published on this collection's channel.
    pub fn event_prefix(self) -> &'static str {
        match self {
            Collection::Weapons => "weapon",
            Collection::WeaponTypes => "weapon-type",
            Collection::Users => "user",
        }
    }

    /// Key in the data-status document.
    pub fn status_key(self) -> &'static str {
        match self {
            Collection::Weapons => "weapons",
            Collection::WeaponTypes => "weaponTypes",
            Collection::Users => "users",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.status_key())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub discord_nickname: Option<String>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.discord_nickname
            .as_deref()
            .or(self.name.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

/// Link between a user and an external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub provider_id: String,
    /// Identity at the provider (the Discord user id).
    pub account_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_token_expires_at: Option<Millis>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

pub const DISCORD_PROVIDER: &str = "discord";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub token: String,
    pub user_id: String,
    pub csrf: String,
    pub created_at: Millis,
    pub expires_at: Millis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub category: Option<String>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeaponStatus {
    #[default]
    Available,
    Assigned,
    Maintenance,
    Retired,
}

impl WeaponStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WeaponStatus::Available => "AVAILABLE",
            WeaponStatus::Assigned => "ASSIGNED",
            WeaponStatus::Maintenance => "MAINTENANCE",
            WeaponStatus::Retired => "RETIRED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Weapon {
    pub id: String,
    pub serial_number: String,
    pub name: String,
    #[serde(default)]
    pub weapon_type_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: WeaponStatus,
    #[serde(default)]
    pub ammunition: u32,
    #[serde(default)]
    pub assigned_to_id: Option<String>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    Created,
    Updated,
    Deleted,
    Assigned,
    Returned,
}

/// Audit row; appended, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponLog {
    pub id: String,
    pub action: LogAction,
    pub weapon_id: String,
    pub user_id: String,
    pub timestamp: Millis,
    #[serde(default)]
    pub notes: Option<String>,
}
