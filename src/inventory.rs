//!
//! armory inventory
//! ----------------
//! Domain operations on weapons, weapon types, users and the audit log.
//!
//! Every mutation runs inside one store transaction and hands back the
//! change events to publish once the transaction has committed. Weapon
//! mutations append an audit row in the same transaction.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::identity::Principal;
use crate::model::{
    new_id, LogAction, Millis, Role, User, Weapon, WeaponLog, WeaponStatus, WeaponType,
};
use crate::push::{ChangeEvent, ChangeKind};
use crate::storage::{SharedStore, Tables};

/// Result of a committed mutation plus the events it should announce.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<T> {
    pub value: T,
    pub events: Vec<ChangeEvent>,
}

impl<T> Mutation<T> {
    fn new(value: T, events: Vec<ChangeEvent>) -> Self {
        Self { value, events }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWeapon {
    pub serial_number: String,
    pub name: String,
    #[serde(default, alias = "type")]
    pub weapon_type_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ammunition: Option<u32>,
}

/// Partial update; absent fields are left alone. An empty `weaponTypeId` clears the type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponPatch {
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "type")]
    pub weapon_type_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<WeaponStatus>,
    #[serde(default)]
    pub ammunition: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub weapon_id: String,
    /// Defaults to the caller.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequest {
    pub weapon_id: String,
    #[serde(default)]
    pub ammunition: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWeaponType {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponTypePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub discord_nickname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(default)]
    pub weapon_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn required(field: &str, value: &str) -> AppResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(AppError::user("missing_field", format!("{} is required", field)));
    }
    Ok(v.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn require_admin(actor: &Principal) -> AppResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(AppError::forbidden("admin_required", "Administrator role required"))
    }
}

fn append_log(t: &mut Tables, action: LogAction, weapon_id: &str, user_id: &str, now: Millis, notes: Option<String>) {
    t.logs.push(WeaponLog {
        id: new_id(),
        action,
        weapon_id: weapon_id.to_string(),
        user_id: user_id.to_string(),
        timestamp: now,
        notes,
    });
}

fn weapon_not_found(id: &str) -> AppError {
    AppError::not_found("weapon_not_found", format!("Weapon {} not found", id))
}

fn ensure_serial_free(t: &Tables, serial: &str, except: Option<&str>) -> AppResult<()> {
    let taken = t
        .weapons
        .values()
        .any(|w| w.serial_number.eq_ignore_ascii_case(serial) && Some(w.id.as_str()) != except);
    if taken {
        return Err(AppError::conflict("serial_taken", format!("Serial number {} is already in use", serial)));
    }
    Ok(())
}

fn ensure_type_exists(t: &Tables, type_id: Option<&str>) -> AppResult<()> {
    match type_id {
        Some(id) if !t.weapon_types.contains_key(id) => {
            Err(AppError::not_found("weapon_type_not_found", format!("Weapon type {} not found", id)))
        }
        _ => Ok(()),
    }
}

fn display_name_of(t: &Tables, user_id: &str) -> String {
    t.users.get(user_id).map(|u| u.display_name().to_string()).unwrap_or_else(|| user_id.to_string())
}

pub fn create_weapon(store: &SharedStore, actor: &Principal, input: NewWeapon) -> AppResult<Mutation<Weapon>> {
    require_admin(actor)?;
    let serial = required("serialNumber", &input.serial_number)?;
    let name = required("name", &input.name)?;
    let type_id = optional_text(input.weapon_type_id);
    let weapon = store.transact(|t, now| {
        ensure_serial_free(t, &serial, None)?;
        ensure_type_exists(t, type_id.as_deref())?;
        let weapon = Weapon {
            id: new_id(),
            serial_number: serial.clone(),
            name: name.clone(),
            weapon_type_id: type_id.clone(),
            description: optional_text(input.description.clone()),
            status: WeaponStatus::Available,
            ammunition: input.ammunition.unwrap_or(0),
            assigned_to_id: None,
            created_at: now,
            updated_at: now,
        };
        append_log(t, LogAction::Created, &weapon.id, &actor.user_id, now, Some(format!("Created {} ({})", name, serial)));
        t.weapons.insert(weapon.id.clone(), weapon.clone());
        Ok(weapon)
    })?;
    info!(weapon = %weapon.id, serial = %weapon.serial_number, by = %actor.user_id, "weapon_created");
    let event = ChangeEvent::weapon(ChangeKind::Created, &weapon.id);
    Ok(Mutation::new(weapon, vec![event]))
}

pub fn update_weapon(store: &SharedStore, actor: &Principal, id: &str, patch: WeaponPatch) -> AppResult<Mutation<Weapon>> {
    require_admin(actor)?;
    if patch.status == Some(WeaponStatus::Assigned) {
        return Err(AppError::user("use_assign", "Use the assign endpoint to assign a weapon"));
    }
    let weapon = store.transact(|t, now| {
        let mut w = t.weapons.get(id).cloned().ok_or_else(|| weapon_not_found(id))?;
        if let Some(serial) = &patch.serial_number {
            let serial = required("serialNumber", serial)?;
            ensure_serial_free(t, &serial, Some(id))?;
            w.serial_number = serial;
        }
        if let Some(name) = &patch.name {
            w.name = required("name", name)?;
        }
        if let Some(type_id) = &patch.weapon_type_id {
            let type_id = optional_text(Some(type_id.clone()));
            ensure_type_exists(t, type_id.as_deref())?;
            w.weapon_type_id = type_id;
        }
        if patch.description.is_some() {
            w.description = optional_text(patch.description.clone());
        }
        if let Some(ammo) = patch.ammunition {
            w.ammunition = ammo;
        }
        let mut returned_from = None;
        if let Some(status) = patch.status {
            if status == WeaponStatus::Available {
                returned_from = w.assigned_to_id.take();
            }
            w.status = status;
        }
        w.updated_at = now;
        match returned_from {
            Some(holder) => {
                let notes = optional_text(patch.notes.clone())
                    .unwrap_or_else(|| format!("Returned to stock by {}", display_name_of(t, &actor.user_id)));
                append_log(t, LogAction::Returned, &w.id, &holder, now, Some(notes));
            }
            None => append_log(t, LogAction::Updated, &w.id, &actor.user_id, now, optional_text(patch.notes.clone())),
        }
        t.weapons.insert(w.id.clone(), w.clone());
        Ok(w)
    })?;
    info!(weapon = %weapon.id, status = weapon.status.as_str(), by = %actor.user_id, "weapon_updated");
    let event = ChangeEvent::weapon(ChangeKind::Updated, &weapon.id);
    Ok(Mutation::new(weapon, vec![event]))
}

/// Audit rows of the weapon are kept.
pub fn delete_weapon(store: &SharedStore, actor: &Principal, id: &str) -> AppResult<Mutation<Weapon>> {
    require_admin(actor)?;
    let weapon = store.transact(|t, now| {
        let w = t.weapons.remove(id).ok_or_else(|| weapon_not_found(id))?;
        append_log(t, LogAction::Deleted, &w.id, &actor.user_id, now, Some(format!("Deleted {} ({})", w.name, w.serial_number)));
        Ok(w)
    })?;
    info!(weapon = %weapon.id, by = %actor.user_id, "weapon_deleted");
    let event = ChangeEvent::weapon(ChangeKind::Deleted, &weapon.id);
    Ok(Mutation::new(weapon, vec![event]))
}

pub fn assign_weapon(store: &SharedStore, actor: &Principal, req: AssignRequest) -> AppResult<Mutation<Weapon>> {
    let target = optional_text(req.user_id.clone()).unwrap_or_else(|| actor.user_id.clone());
    if !actor.may_act_for(&target) {
        return Err(AppError::forbidden("not_allowed", "Only administrators can assign weapons to other users"));
    }
    let weapon = store.transact(|t, now| {
        let holder = t
            .users
            .get(&target)
            .map(|u| u.display_name().to_string())
            .ok_or_else(|| AppError::not_found("user_not_found", format!("User {} not found", target)))?;
        let mut w = t.weapons.get(&req.weapon_id).cloned().ok_or_else(|| weapon_not_found(&req.weapon_id))?;
        if w.status != WeaponStatus::Available {
            return Err(AppError::conflict(
                "weapon_unavailable",
                format!("Weapon is {} and cannot be assigned", w.status.as_str()),
            ));
        }
        w.status = WeaponStatus::Assigned;
        w.assigned_to_id = Some(target.clone());
        w.updated_at = now;
        let notes = optional_text(req.notes.clone()).unwrap_or_else(|| format!("Assigned to {}", holder));
        append_log(t, LogAction::Assigned, &w.id, &target, now, Some(notes));
        t.weapons.insert(w.id.clone(), w.clone());
        Ok(w)
    })?;
    info!(weapon = %weapon.id, to = %target, by = %actor.user_id, "weapon_assigned");
    let event = ChangeEvent::weapon(ChangeKind::Updated, &weapon.id);
    Ok(Mutation::new(weapon, vec![event]))
}

pub fn return_weapon(store: &SharedStore, actor: &Principal, req: ReturnRequest) -> AppResult<Mutation<Weapon>> {
    let weapon = store.transact(|t, now| {
        let mut w = t.weapons.get(&req.weapon_id).cloned().ok_or_else(|| weapon_not_found(&req.weapon_id))?;
        let Some(holder) = w.assigned_to_id.clone() else {
            return Err(AppError::conflict("weapon_not_assigned", "Weapon is not assigned"));
        };
        if !actor.may_act_for(&holder) {
            return Err(AppError::forbidden("not_holder", "Only the holder or an administrator can return this weapon"));
        }
        w.status = WeaponStatus::Available;
        w.assigned_to_id = None;
        if let Some(ammo) = req.ammunition {
            w.ammunition = ammo;
        }
        w.updated_at = now;
        let notes = optional_text(req.notes.clone())
            .unwrap_or_else(|| format!("Returned by {}", display_name_of(t, &actor.user_id)));
        append_log(t, LogAction::Returned, &w.id, &holder, now, Some(notes));
        t.weapons.insert(w.id.clone(), w.clone());
        Ok(w)
    })?;
    info!(weapon = %weapon.id, by = %actor.user_id, "weapon_returned");
    let event = ChangeEvent::weapon(ChangeKind::Updated, &weapon.id);
    Ok(Mutation::new(weapon, vec![event]))
}

pub fn create_weapon_type(store: &SharedStore, actor: &Principal, input: NewWeaponType) -> AppResult<Mutation<WeaponType>> {
    require_admin(actor)?;
    let name = required("name", &input.name)?;
    let wt = store.transact(|t, now| {
        let wt = WeaponType {
            id: new_id(),
            name: name.clone(),
            image: input.image.clone().map(|i| i.trim().to_string()).unwrap_or_default(),
            category: optional_text(input.category.clone()),
            created_at: now,
            updated_at: now,
        };
        t.weapon_types.insert(wt.id.clone(), wt.clone());
        Ok(wt)
    })?;
    info!(weapon_type = %wt.id, name = %wt.name, "weapon_type_created");
    let event = ChangeEvent::weapon_type(ChangeKind::Created, &wt.id);
    Ok(Mutation::new(wt, vec![event]))
}

pub fn update_weapon_type(
    store: &SharedStore,
    actor: &Principal,
    id: &str,
    patch: WeaponTypePatch,
) -> AppResult<Mutation<WeaponType>> {
    require_admin(actor)?;
    let wt = store.transact(|t, now| {
        let mut wt = t
            .weapon_types
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("weapon_type_not_found", format!("Weapon type {} not found", id)))?;
        if let Some(name) = &patch.name {
            wt.name = required("name", name)?;
        }
        if let Some(image) = &patch.image {
            wt.image = image.trim().to_string();
        }
        if patch.category.is_some() {
            wt.category = optional_text(patch.category.clone());
        }
        wt.updated_at = now;
        t.weapon_types.insert(wt.id.clone(), wt.clone());
        Ok(wt)
    })?;
    info!(weapon_type = %wt.id, "weapon_type_updated");
    let event = ChangeEvent::weapon_type(ChangeKind::Updated, &wt.id);
    Ok(Mutation::new(wt, vec![event]))
}

/// Refused while any weapon still references the type.
pub fn delete_weapon_type(store: &SharedStore, actor: &Principal, id: &str) -> AppResult<Mutation<WeaponType>> {
    require_admin(actor)?;
    let wt = store.transact(|t, _| {
        let in_use = t.weapons.values().filter(|w| w.weapon_type_id.as_deref() == Some(id)).count();
        if in_use > 0 {
            return Err(AppError::user(
                "weapon_type_in_use",
                format!("Cannot delete weapon type: {} weapon(s) still use it", in_use),
            ));
        }
        t.weapon_types
            .remove(id)
            .ok_or_else(|| AppError::not_found("weapon_type_not_found", format!("Weapon type {} not found", id)))
    })?;
    info!(weapon_type = %wt.id, "weapon_type_deleted");
    let event = ChangeEvent::weapon_type(ChangeKind::Deleted, &wt.id);
    Ok(Mutation::new(wt, vec![event]))
}

pub fn update_user(store: &SharedStore, actor: &Principal, id: &str, patch: UserPatch) -> AppResult<Mutation<User>> {
    require_admin(actor)?;
    let user = store.transact(|t, now| {
        let mut u = t
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("user_not_found", format!("User {} not found", id)))?;
        if let Some(role) = patch.role {
            u.role = role;
        }
        if patch.name.is_some() {
            u.name = optional_text(patch.name.clone());
        }
        if patch.discord_nickname.is_some() {
            u.discord_nickname = optional_text(patch.discord_nickname.clone());
        }
        u.updated_at = now;
        t.users.insert(u.id.clone(), u.clone());
        Ok(u)
    })?;
    info!(user = %user.id, by = %actor.user_id, "user_updated");
    let event = ChangeEvent::user(ChangeKind::Updated, &user.id);
    Ok(Mutation::new(user, vec![event]))
}

pub fn delete_user(store: &SharedStore, actor: &Principal, id: &str) -> AppResult<Mutation<User>> {
    require_admin(actor)?;
    if actor.user_id == id {
        return Err(AppError::user("cannot_delete_self", "You cannot delete your own account"));
    }
    let (user, events) = store.transact(|t, now| {
        let user = t
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("user_not_found", format!("User {} not found", id)))?;
        let events = deprovision_user(t, id, now);
        Ok((user, events))
    })?;
    info!(user = %user.id, by = %actor.user_id, "user_deleted");
    Ok(Mutation::new(user, events))
}

/// Return held weapons to stock, then drop the user's sessions, accounts and user row.
pub fn deprovision_user(t: &mut Tables, user_id: &str, now: Millis) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let held: Vec<String> = t
        .weapons
        .values()
        .filter(|w| w.assigned_to_id.as_deref() == Some(user_id))
        .map(|w| w.id.clone())
        .collect();
    for weapon_id in held {
        if let Some(w) = t.weapons.get_mut(&weapon_id) {
            w.status = WeaponStatus::Available;
            w.assigned_to_id = None;
            w.updated_at = now;
        }
        append_log(t, LogAction::Returned, &weapon_id, user_id, now, Some("Returned on account removal".to_string()));
        events.push(ChangeEvent::weapon(ChangeKind::Updated, weapon_id));
    }
    t.delete_sessions_of(user_id);
    t.delete_accounts_of(user_id);
    if t.users.remove(user_id).is_some() {
        events.push(ChangeEvent::user(ChangeKind::Deleted, user_id));
    }
    events
}

/// Promote a user to administrator.
pub fn make_admin(store: &SharedStore, user_id: &str) -> AppResult<Mutation<User>> {
    let user = store.transact(|t, now| {
        let u = t
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::not_found("user_not_found", format!("User {} not found", user_id)))?;
        u.role = Role::Admin;
        u.updated_at = now;
        Ok(u.clone())
    })?;
    info!(user = %user.id, "user_promoted_to_admin");
    let event = ChangeEvent::user(ChangeKind::Updated, &user.id);
    Ok(Mutation::new(user, vec![event]))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub discord_nickname: Option<String>,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            id: u.id.clone(),
            name: u.name.clone(),
            email: u.email.clone(),
            image: u.image.clone(),
            discord_nickname: u.discord_nickname.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponSummary {
    pub id: String,
    pub name: String,
    pub serial_number: String,
    pub status: WeaponStatus,
}

impl From<&Weapon> for WeaponSummary {
    fn from(w: &Weapon) -> Self {
        Self { id: w.id.clone(), name: w.name.clone(), serial_number: w.serial_number.clone(), status: w.status }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaponView {
    #[serde(flatten)]
    pub weapon: Weapon,
    #[serde(default)]
    pub weapon_type: Option<WeaponType>,
    #[serde(default)]
    pub assigned_to: Option<UserSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub weapons: Vec<WeaponSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogView {
    #[serde(flatten)]
    pub log: WeaponLog,
    #[serde(default)]
    pub weapon: Option<WeaponSummary>,
    #[serde(default)]
    pub user: Option<UserSummary>,
}

fn weapon_view(t: &Tables, w: &Weapon) -> WeaponView {
    WeaponView {
        weapon: w.clone(),
        weapon_type: w.weapon_type_id.as_ref().and_then(|id| t.weapon_types.get(id)).cloned(),
        assigned_to: w.assigned_to_id.as_ref().and_then(|id| t.users.get(id)).map(UserSummary::from),
    }
}

/// Newest first.
pub fn list_weapons(t: &Tables) -> Vec<WeaponView> {
    let mut rows: Vec<&Weapon> = t.weapons.values().collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    rows.into_iter().map(|w| weapon_view(t, w)).collect()
}

pub fn get_weapon(t: &Tables, id: &str) -> AppResult<WeaponView> {
    t.weapons.get(id).map(|w| weapon_view(t, w)).ok_or_else(|| weapon_not_found(id))
}

pub fn list_weapon_types(t: &Tables) -> Vec<WeaponType> {
    let mut rows: Vec<WeaponType> = t.weapon_types.values().cloned().collect();
    rows.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then_with(|| a.id.cmp(&b.id)));
    rows
}

pub fn list_users(t: &Tables) -> Vec<UserView> {
    let mut rows: Vec<UserView> = t
        .users
        .values()
        .map(|u| UserView {
            user: u.clone(),
            weapons: t
                .weapons
                .values()
                .filter(|w| w.assigned_to_id.as_deref() == Some(u.id.as_str()))
                .map(WeaponSummary::from)
                .collect(),
        })
        .collect();
    rows.sort_by(|a, b| a.user.display_name().to_lowercase().cmp(&b.user.display_name().to_lowercase()));
    rows
}

/// Newest first; weapon and user summaries are attached when those rows still exist.
pub fn list_logs(t: &Tables, filter: &LogFilter) -> Vec<LogView> {
    let mut rows: Vec<&WeaponLog> = t
        .logs
        .iter()
        .filter(|l| filter.weapon_id.as_deref().map_or(true, |id| l.weapon_id == id))
        .filter(|l| filter.user_id.as_deref().map_or(true, |id| l.user_id == id))
        .collect();
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    rows.into_iter()
        .take(filter.limit.unwrap_or(usize::MAX))
        .map(|l| LogView {
            log: l.clone(),
            weapon: t.weapons.get(&l.weapon_id).map(WeaponSummary::from),
            user: t.users.get(&l.user_id).map(UserSummary::from),
        })
        .collect()
}
