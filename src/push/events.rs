use serde::{Deserialize, Serialize};

use crate::model::Collection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// "Something changed in this collection". Carries no authoritative state;
/// receivers re-fetch the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
    pub subject_id: Option<String>,
}

impl ChangeEvent {
    pub fn new(collection: Collection, kind: ChangeKind, subject_id: impl Into<String>) -> Self {
        Self { collection, kind, subject_id: Some(subject_id.into()) }
    }

    pub fn weapon(kind: ChangeKind, id: impl Into<String>) -> Self {
        Self::new(Collection::Weapons, kind, id)
    }

    pub fn weapon_type(kind: ChangeKind, id: impl Into<String>) -> Self {
        Self::new(Collection::WeaponTypes, kind, id)
    }

    pub fn user(kind: ChangeKind, id: impl Into<String>) -> Self {
        Self::new(Collection::Users, kind, id)
    }

    pub fn channel(&self) -> &'static str {
        self.collection.channel()
    }

    /// e.g. `weapon-type-deleted`.
    pub fn event_name(&self) -> String {
        event_name(self.collection, self.kind)
    }

    /// `{id}` or `{}`.
    pub fn payload(&self) -> serde_json::Value {
        match &self.subject_id {
            Some(id) => serde_json::json!({ "id": id }),
            None => serde_json::json!({}),
        }
    }

    /// Inverse of `channel()` / `event_name()` / `payload()`.
    pub fn parse(channel: &str, event: &str, payload: &serde_json::Value) -> Option<Self> {
        let collection = Collection::from_channel(channel)?;
        let kind = events_for(collection).into_iter().find(|k| event_name(collection, *k) == event)?;
        let subject_id = payload.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
        Some(Self { collection, kind, subject_id })
    }
}

pub fn event_name(collection: Collection, kind: ChangeKind) -> String {
    format!("{}-{}", collection.event_prefix(), kind.as_str())
}

/// Event kinds published on a collection's channel. Users are never announced as created.
pub fn events_for(collection: Collection) -> Vec<ChangeKind> {
    match collection {
        Collection::Weapons | Collection::WeaponTypes => {
            vec![ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted]
        }
        Collection::Users => vec![ChangeKind::Updated, ChangeKind::Deleted],
    }
}
