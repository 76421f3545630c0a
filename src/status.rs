//! Data-status document: the latest modification stamp of each collection.
//!
//! Clients compare consecutive documents to learn which collections changed
//! without downloading them.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::model::{Collection, Millis};
use crate::storage::SharedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub weapons: Millis,
    pub weapon_types: Millis,
    pub users: Millis,
}

impl CollectionStatus {
    pub fn get(&self, collection: Collection) -> Millis {
        match collection {
            Collection::Weapons => self.weapons,
            Collection::WeaponTypes => self.weapon_types,
            Collection::Users => self.users,
        }
    }

    /// Collections whose stamp differs from `previous`, in enumeration order.
    pub fn changed_since(&self, previous: &CollectionStatus) -> Vec<Collection> {
        Collection::ALL
            .into_iter()
            .filter(|c| self.get(*c) != previous.get(*c))
            .collect()
    }
}

/// Read side of the status document: one query per collection.
pub trait CollectionClock: Send + Sync {
    /// Latest `updated_at` in the collection, `None` when it has no rows.
    fn latest_update(&self, collection: Collection) -> AppResult<Option<Millis>>;
}

impl CollectionClock for SharedStore {
    fn latest_update(&self, collection: Collection) -> AppResult<Option<Millis>> {
        Ok(self.read(|t| t.latest_update(collection)))
    }
}

/// Build the status document. Any failing query fails the whole document.
pub fn compute_status(clock: &dyn CollectionClock) -> AppResult<CollectionStatus> {
    let read = |c: Collection| -> AppResult<Millis> {
        clock
            .latest_update(c)
            .map(|v| v.unwrap_or(0))
            .map_err(|e| AppError::query("status_query_failed", format!("{} status: {}", c, e.message())))
    };
    Ok(CollectionStatus {
        weapons: read(Collection::Weapons)?,
        weapon_types: read(Collection::WeaponTypes)?,
        users: read(Collection::Users)?,
    })
}
