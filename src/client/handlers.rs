use std::sync::Arc;

use crate::model::Collection;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Per-collection callbacks shared by the detector and the push subscriber.
/// Each one is expected to re-fetch its collection.
#[derive(Clone, Default)]
pub struct ChangeHandlers {
    pub on_weapons_change: Option<Callback>,
    pub on_weapon_types_change: Option<Callback>,
    pub on_users_change: Option<Callback>,
}

impl ChangeHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_weapons(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_weapons_change = Some(Arc::new(f));
        self
    }

    pub fn on_weapon_types(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_weapon_types_change = Some(Arc::new(f));
        self
    }

    pub fn on_users(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_users_change = Some(Arc::new(f));
        self
    }

    pub fn get(&self, collection: Collection) -> Option<&Callback> {
        match collection {
            Collection::Weapons => self.on_weapons_change.as_ref(),
            Collection::WeaponTypes => self.on_weapon_types_change.as_ref(),
            Collection::Users => self.on_users_change.as_ref(),
        }
    }

    /// Invoke the callback for `collection`; false when none is set.
    pub fn fire(&self, collection: Collection) -> bool {
        match self.get(collection) {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    /// Collections that have a callback.
    pub fn bound(&self) -> Vec<Collection> {
        Collection::ALL.into_iter().filter(|c| self.get(*c).is_some()).collect()
    }
}

impl std::fmt::Debug for ChangeHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeHandlers").field("bound", &self.bound()).finish()
    }
}
