//!
//! armory storage module
//! ---------------------
//! In-process tables for users, accounts, sessions, weapon types, weapons and
//! the audit log, optionally snapshotted to a JSON data file.
//!
//! Key responsibilities:
//! - A monotonic per-store clock so every mutation gets a strictly newer stamp.
//! - Transactional mutation: work happens on a copy of the tables, which is
//!   persisted and only then swapped in. A failed closure or a failed write
//!   leaves the visible state untouched.
//! - Atomic snapshot writes (temp file + rename). Each mutation clones and
//!   serializes the whole store, so its cost grows with the store size. Inside
//!   a multi-thread tokio runtime the write runs under `block_in_place` so the
//!   worker hands its other tasks off while the disk is busy.
//!
//! The public API centers around `Store`, usually wrapped in the thread-safe
//! `SharedStore` (`Arc<Mutex<Store>>`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::model::{now_millis, Account, Collection, Millis, SessionRow, User, Weapon, WeaponLog, WeaponType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tables {
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRow>,
    #[serde(default)]
    pub weapon_types: BTreeMap<String, WeaponType>,
    #[serde(default)]
    pub weapons: BTreeMap<String, Weapon>,
    #[serde(default)]
    pub logs: Vec<WeaponLog>,
}

impl Tables {
    /// Latest `updated_at` across the rows of a collection, `None` when empty.
    pub fn latest_update(&self, collection: Collection) -> Option<Millis> {
        match collection {
            Collection::Weapons => self.weapons.values().map(|w| w.updated_at).max(),
            Collection::WeaponTypes => self.weapon_types.values().map(|t| t.updated_at).max(),
            Collection::Users => self.users.values().map(|u| u.updated_at).max(),
        }
    }

    /// Largest stamp present anywhere, used to seed the clock after a reload.
    fn high_water_mark(&self) -> Millis {
        let rows = Collection::ALL.iter().filter_map(|c| self.latest_update(*c));
        let logs = self.logs.iter().map(|l| l.timestamp);
        let sessions = self.sessions.values().map(|s| s.created_at);
        let accounts = self.accounts.values().map(|a| a.updated_at);
        rows.chain(logs).chain(sessions).chain(accounts).max().unwrap_or(0)
    }

    pub fn discord_account_for(&self, user_id: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.user_id == user_id && a.provider_id == crate::model::DISCORD_PROVIDER)
    }

    pub fn account_by_provider(&self, provider_id: &str, account_id: &str) -> Option<&Account> {
        self.accounts
            .values()
            .find(|a| a.provider_id == provider_id && a.account_id == account_id)
    }

    /// Remove every session row of a user; returns how many were removed.
    pub fn delete_sessions_of(&mut self, user_id: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.user_id != user_id);
        before - self.sessions.len()
    }

    pub fn delete_accounts_of(&mut self, user_id: &str) -> usize {
        let before = self.accounts.len();
        self.accounts.retain(|_, a| a.user_id != user_id);
        before - self.accounts.len()
    }
}

pub struct Store {
    tables: Tables,
    snapshot: Option<PathBuf>,
    last_stamp: Millis,
}

impl Store {
    pub fn in_memory() -> Self {
        Self { tables: Tables::default(), snapshot: None, last_stamp: 0 }
    }

    /// Open a store backed by a JSON data file, loading it when it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let raw = std::fs::read(&path)?;
            let tables: Tables = serde_json::from_slice(&raw).map_err(|e| {
                AppError::io("snapshot_corrupt", &format!("cannot parse {}: {}", path.display(), e))
            })?;
            info!(
                target: "startup",
                "loaded data file {}: users={}, weapons={}, weapon_types={}, logs={}",
                path.display(),
                tables.users.len(),
                tables.weapons.len(),
                tables.weapon_types.len(),
                tables.logs.len()
            );
            tables
        } else {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            Tables::default()
        };
        let last_stamp = tables.high_water_mark();
        Ok(Self { tables, snapshot: Some(path), last_stamp })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Next clock value: wall-clock millis, bumped past the previous stamp if needed.
    pub fn stamp(&mut self) -> Millis {
        let now = now_millis();
        self.last_stamp = if now > self.last_stamp { now } else { self.last_stamp + 1 };
        self.last_stamp
    }

    /// Run `f` against a copy of the tables, persist the copy, then make it visible.
    pub fn transact<T>(&mut self, f: impl FnOnce(&mut Tables, Millis) -> AppResult<T>) -> AppResult<T> {
        let now = self.stamp();
        let mut work = self.tables.clone();
        let out = f(&mut work, now)?;
        if let Some(path) = &self.snapshot {
            off_worker(|| write_snapshot(path, &work))?;
        }
        self.tables = work;
        Ok(out)
    }
}

/// Run blocking disk work without stalling an async worker thread.
fn off_worker<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(h) if h.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

fn write_snapshot(path: &Path, tables: &Tables) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(tables)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "snapshot_written");
    Ok(())
}

#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn in_memory() -> Self {
        SharedStore(Arc::new(Mutex::new(Store::in_memory())))
    }

    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(SharedStore(Arc::new(Mutex::new(Store::open(path)?))))
    }

    /// Read under the lock. Keep the closure short and never await inside it.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let guard = self.0.lock();
        f(guard.tables())
    }

    pub fn transact<T>(&self, f: impl FnOnce(&mut Tables, Millis) -> AppResult<T>) -> AppResult<T> {
        self.0.lock().transact(f)
    }
}
