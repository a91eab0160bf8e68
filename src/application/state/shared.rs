//! Shared-state capability registry
//!
//! Every plugin owns one namespace of variables. Only the owner writes
//! to it; another plugin may read the owner's *registered* variables
//! while a grant `owner -> reader` exists. Grants are checked on every
//! read, so a revoke is visible to the very next call.
//!
//! Locking: the namespace table and the grant graph each have their own
//! `RwLock`, and each namespace its own `Mutex`, so unrelated plugins
//! never contend. When both are needed the grant graph is locked first.
//!
//! A purged plugin leaves a tombstone: writes and grants under its name
//! are refused until a fresh load calls `ensure_namespace`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::application::errors::PluginError;

/// Audit entries kept before the oldest are dropped
pub const AUDIT_CAPACITY: usize = 1000;

/// One stored value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedVariable {
    pub value: Value,
    /// Declared through `register` rather than an ad-hoc `set`
    pub registered: bool,
}

/// A foreign read attempt, granted or not
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub at: DateTime<Utc>,
    pub reader: String,
    pub owner: String,
    pub key: String,
    pub allowed: bool,
}

#[derive(Debug, Default)]
struct Namespace {
    vars: HashMap<String, SharedVariable>,
}

type NamespaceRef = Arc<Mutex<Namespace>>;

/// Namespaced variable store plus grantor -> grantee authorization graph
#[derive(Default)]
pub struct SharedStateRegistry {
    namespaces: RwLock<HashMap<String, NamespaceRef>>,
    grants: RwLock<HashMap<String, HashSet<String>>>,
    // innermost lock: taken after `namespaces` or `grants`, never before
    retired: Mutex<HashSet<String>>,
    audit: Mutex<VecDeque<AccessRecord>>,
}

impl SharedStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the plugin's namespace if it does not exist yet and lifts
    /// any tombstone left by an earlier purge.
    pub fn ensure_namespace(&self, plugin: &str) {
        let mut namespaces = write(&self.namespaces);
        lock(&self.retired).remove(plugin);
        namespaces.entry(plugin.to_string()).or_default();
    }

    pub fn is_retired(&self, plugin: &str) -> bool {
        lock(&self.retired).contains(plugin)
    }

    pub fn has_namespace(&self, plugin: &str) -> bool {
        read(&self.namespaces).contains_key(plugin)
    }

    /// Declares `key`. An existing key keeps its value and is only
    /// flagged as registered. Returns true if the key was created;
    /// always false for a purged plugin.
    pub fn register(&self, plugin: &str, key: &str, default_value: Value) -> bool {
        let Some(ns) = self.namespace(plugin) else {
            return false;
        };
        let mut ns = lock(&ns);
        match ns.vars.get_mut(key) {
            Some(existing) => {
                existing.registered = true;
                false
            }
            None => {
                ns.vars.insert(
                    key.to_string(),
                    SharedVariable { value: default_value, registered: true },
                );
                true
            }
        }
    }

    /// Stores `value`; returns false, storing nothing, for a purged plugin.
    pub fn set(&self, plugin: &str, key: &str, value: Value) -> bool {
        let Some(ns) = self.namespace(plugin) else {
            return false;
        };
        let mut ns = lock(&ns);
        match ns.vars.get_mut(key) {
            Some(existing) => existing.value = value,
            None => {
                ns.vars.insert(key.to_string(), SharedVariable { value, registered: false });
            }
        }
        true
    }

    pub fn get(&self, plugin: &str, key: &str) -> Option<Value> {
        let ns = self.existing(plugin)?;
        let ns = lock(&ns);
        ns.vars.get(key).map(|var| var.value.clone())
    }

    /// Full entry, including the registered flag
    pub fn variable(&self, plugin: &str, key: &str) -> Option<SharedVariable> {
        let ns = self.existing(plugin)?;
        let ns = lock(&ns);
        ns.vars.get(key).cloned()
    }

    pub fn get_or(&self, plugin: &str, key: &str, default: Value) -> Value {
        self.get(plugin, key).unwrap_or(default)
    }

    pub fn get_all(&self, plugin: &str) -> BTreeMap<String, Value> {
        let Some(ns) = self.existing(plugin) else {
            return BTreeMap::new();
        };
        let ns = lock(&ns);
        ns.vars
            .iter()
            .map(|(key, var)| (key.clone(), var.value.clone()))
            .collect()
    }

    pub fn delete(&self, plugin: &str, key: &str) -> bool {
        match self.existing(plugin) {
            Some(ns) => lock(&ns).vars.remove(key).is_some(),
            None => false,
        }
    }

    /// Empties the namespace, returns how many entries were removed.
    pub fn clear(&self, plugin: &str) -> usize {
        match self.existing(plugin) {
            Some(ns) => {
                let mut ns = lock(&ns);
                let removed = ns.vars.len();
                ns.vars.clear();
                removed
            }
            None => 0,
        }
    }

    /// Lets `grantee` read `grantor`'s registered variables. Idempotent;
    /// returns true if the edge is new.
    pub fn grant(&self, grantor: &str, grantee: &str) -> bool {
        if grantor == grantee {
            return false;
        }
        let mut grants = write(&self.grants);
        if self.is_retired(grantor) {
            debug!(grantor, grantee, "grant from purged plugin refused");
            return false;
        }
        let added = grants
            .entry(grantor.to_string())
            .or_default()
            .insert(grantee.to_string());
        if added {
            debug!(grantor, grantee, "shared-state grant added");
        }
        added
    }

    pub fn revoke(&self, grantor: &str, grantee: &str) -> bool {
        let mut grants = write(&self.grants);
        let removed = match grants.get_mut(grantor) {
            Some(grantees) => grantees.remove(grantee),
            None => false,
        };
        if grants.get(grantor).is_some_and(HashSet::is_empty) {
            grants.remove(grantor);
        }
        if removed {
            debug!(grantor, grantee, "shared-state grant revoked");
        }
        removed
    }

    pub fn is_granted(&self, owner: &str, reader: &str) -> bool {
        owner == reader || Self::edge_exists(&read(&self.grants), owner, reader)
    }

    pub fn grantees(&self, owner: &str) -> Vec<String> {
        let mut names: Vec<String> = read(&self.grants)
            .get(owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Reads `owner`'s registered `key` on behalf of `reader`.
    ///
    /// `Err(AccessDenied)` without a live grant; `Ok(None)` when the key
    /// is absent or was never registered.
    pub fn get_foreign(&self, reader: &str, owner: &str, key: &str) -> Result<Option<Value>, PluginError> {
        // hold the graph while reading so a concurrent revoke cannot interleave
        let grants = read(&self.grants);
        let allowed = owner == reader || Self::edge_exists(&grants, owner, reader);
        self.audit(reader, owner, key, allowed);

        if !allowed {
            return Err(PluginError::AccessDenied {
                reader: reader.to_string(),
                owner: owner.to_string(),
            });
        }

        let Some(ns) = self.existing(owner) else {
            return Ok(None);
        };
        let ns = lock(&ns);
        drop(grants);
        Ok(ns
            .vars
            .get(key)
            .filter(|var| var.registered || owner == reader)
            .map(|var| var.value.clone()))
    }

    /// Removes the plugin's namespace and every grant it takes part in,
    /// and tombstones the name.
    pub fn purge(&self, plugin: &str) {
        let mut grants = write(&self.grants);
        grants.remove(plugin);
        for grantees in grants.values_mut() {
            grantees.remove(plugin);
        }
        grants.retain(|_, grantees| !grantees.is_empty());

        let mut namespaces = write(&self.namespaces);
        namespaces.remove(plugin);
        lock(&self.retired).insert(plugin.to_string());
        drop(namespaces);
        drop(grants);
        debug!(plugin, "shared-state namespace purged");
    }

    /// Most recent foreign reads, newest last
    pub fn access_log(&self, limit: usize) -> Vec<AccessRecord> {
        let audit = lock(&self.audit);
        let skip = audit.len().saturating_sub(limit);
        audit.iter().skip(skip).cloned().collect()
    }

    fn audit(&self, reader: &str, owner: &str, key: &str, allowed: bool) {
        let mut audit = lock(&self.audit);
        if audit.len() >= AUDIT_CAPACITY {
            audit.pop_front();
        }
        audit.push_back(AccessRecord {
            at: Utc::now(),
            reader: reader.to_string(),
            owner: owner.to_string(),
            key: key.to_string(),
            allowed,
        });
    }

    fn edge_exists(grants: &HashMap<String, HashSet<String>>, owner: &str, reader: &str) -> bool {
        grants.get(owner).is_some_and(|set| set.contains(reader))
    }

    fn existing(&self, plugin: &str) -> Option<NamespaceRef> {
        read(&self.namespaces).get(plugin).cloned()
    }

    /// Namespace for a write, created on first use. `None` once purged.
    fn namespace(&self, plugin: &str) -> Option<NamespaceRef> {
        if let Some(ns) = self.existing(plugin) {
            return Some(ns);
        }
        let mut namespaces = write(&self.namespaces);
        if self.is_retired(plugin) {
            debug!(plugin, "write to purged namespace refused");
            return None;
        }
        Some(namespaces.entry(plugin.to_string()).or_default().clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
