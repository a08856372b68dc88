//! Blackboard scopes.
//!
//! Every subtree instance gets its own scope. Scopes live in a single arena
//! owned by the tree, and a child scope only knows the index of its parent.
//!
//! A lookup that misses in a scope continues in the parent only for keys the
//! subtree explicitly remapped, or for every public key if the scope was
//! created with autoremap. Keys starting with an underscore are always local.
//! Writes to a remapped key land in the parent entry; any other write stays
//! in the scope it was made in.

use crate::{error::TickError, PortType, Symbol};
use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

pub type ScopeId = usize;

/// The root scope of every tree.
pub const ROOT_SCOPE: ScopeId = 0;

type Value = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct Entry {
    value: Value,
    type_name: &'static str,
    port: Option<PortType>,
}

/// Metadata of a resolved blackboard entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub type_name: &'static str,
    /// The entry lives in an ancestor scope and was reached through a remap.
    pub remapped: bool,
    /// The direction of the port that last wrote the entry, if it was written through a port.
    pub port: Option<PortType>,
}

#[derive(Clone)]
struct Blackboard {
    name: String,
    entries: HashMap<Symbol, Entry>,
    parent: Option<ScopeId>,
    /// Local key to parent key.
    remapping: HashMap<Symbol, Symbol>,
    autoremap: bool,
}

impl Blackboard {
    fn new(name: String, parent: Option<ScopeId>) -> Self {
        Self {
            name,
            entries: HashMap::new(),
            parent,
            remapping: HashMap::new(),
            autoremap: false,
        }
    }

    /// Where a miss on `key` continues, if anywhere.
    fn forward(&self, key: Symbol) -> Option<(ScopeId, Symbol)> {
        let parent = self.parent?;
        if let Some(mapped) = self.remapping.get(&key) {
            Some((parent, *mapped))
        } else if self.autoremap && !key.starts_with('_') {
            Some((parent, key))
        } else {
            None
        }
    }
}

/// Arena of blackboard scopes.
#[derive(Clone)]
pub struct Blackboards {
    scopes: Vec<Blackboard>,
    /// Bumped on every change to entries, scopes or remaps.
    version: u64,
}

impl Default for Blackboards {
    fn default() -> Self {
        Self::new()
    }
}

impl Blackboards {
    /// Creates an arena with only the root scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Blackboard::new("main".to_owned(), None)],
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Scopes with the given name, in creation order. Several instances of
    /// the same subtree share a name.
    pub fn find_scopes<'a>(&'a self, name: &'a str) -> impl Iterator<Item = ScopeId> + 'a {
        self.scopes
            .iter()
            .enumerate()
            .filter(move |(_, bb)| bb.name == name)
            .map(|(scope, _)| scope)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn create_child(&mut self, parent: ScopeId, name: impl Into<String>) -> ScopeId {
        self.scopes.push(Blackboard::new(name.into(), Some(parent)));
        self.version += 1;
        self.scopes.len() - 1
    }

    pub fn scope_name(&self, scope: ScopeId) -> Option<&str> {
        self.scopes.get(scope).map(|bb| bb.name.as_str())
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes.get(scope).and_then(|bb| bb.parent)
    }

    /// Makes `local` in `scope` an alias of `parent_key` in the parent scope.
    pub fn add_remap(&mut self, scope: ScopeId, local: impl Into<Symbol>, parent_key: impl Into<Symbol>) {
        if let Some(bb) = self.scopes.get_mut(scope) {
            bb.remapping.insert(local.into(), parent_key.into());
            self.version += 1;
        }
    }

    pub fn set_autoremap(&mut self, scope: ScopeId, autoremap: bool) {
        if let Some(bb) = self.scopes.get_mut(scope) {
            bb.autoremap = autoremap;
            self.version += 1;
        }
    }

    /// Finds the scope and key holding the entry visible as `key` from `scope`.
    fn resolve_read(&self, mut scope: ScopeId, mut key: Symbol) -> Option<(ScopeId, Symbol)> {
        loop {
            let bb = self.scopes.get(scope)?;
            if bb.entries.contains_key(&key) {
                return Some((scope, key));
            }
            (scope, key) = bb.forward(key)?;
        }
    }

    /// Finds the scope and key a write to `key` from `scope` must go to.
    fn resolve_write(&self, mut scope: ScopeId, mut key: Symbol) -> (ScopeId, Symbol) {
        loop {
            let Some(bb) = self.scopes.get(scope) else {
                return (scope, key);
            };
            if bb.entries.contains_key(&key) && !bb.remapping.contains_key(&key) {
                return (scope, key);
            }
            match bb.forward(key) {
                Some(next) => (scope, key) = next,
                None => return (scope, key),
            }
        }
    }

    pub fn contains(&self, scope: ScopeId, key: impl Into<Symbol>) -> bool {
        self.resolve_read(scope, key.into()).is_some()
    }

    pub fn get<T: 'static>(&self, scope: ScopeId, key: impl Into<Symbol>) -> Option<&T> {
        self.get_checked(scope, key).ok().flatten()
    }

    /// Like [`Self::get`], but tells a missing entry apart from one of another type.
    pub fn get_checked<T: 'static>(
        &self,
        scope: ScopeId,
        key: impl Into<Symbol>,
    ) -> Result<Option<&T>, TickError> {
        let key = key.into();
        let Some((owner, owner_key)) = self.resolve_read(scope, key) else {
            return Ok(None);
        };
        let entry = &self.scopes[owner].entries[&owner_key];
        entry
            .value
            .downcast_ref::<T>()
            .map(Some)
            .ok_or(TickError::TypeMismatch {
                key,
                found: entry.type_name,
            })
    }

    pub fn get_any(&self, scope: ScopeId, key: impl Into<Symbol>) -> Option<Arc<dyn Any + Send + Sync>> {
        let (owner, owner_key) = self.resolve_read(scope, key.into())?;
        Some(self.scopes[owner].entries[&owner_key].value.clone())
    }

    pub fn set<T: Any + Send + Sync>(&mut self, scope: ScopeId, key: impl Into<Symbol>, val: T) {
        self.insert(scope, key.into(), Arc::new(val), std::any::type_name::<T>(), None);
    }

    pub(crate) fn set_through_port<T: Any + Send + Sync>(
        &mut self,
        scope: ScopeId,
        key: Symbol,
        val: T,
        port: PortType,
    ) {
        self.insert(scope, key, Arc::new(val), std::any::type_name::<T>(), Some(port));
    }

    fn insert(
        &mut self,
        scope: ScopeId,
        key: Symbol,
        value: Value,
        type_name: &'static str,
        port: Option<PortType>,
    ) {
        let (owner, owner_key) = self.resolve_write(scope, key);
        if let Some(bb) = self.scopes.get_mut(owner) {
            bb.entries.insert(
                owner_key,
                Entry {
                    value,
                    type_name,
                    port,
                },
            );
            self.version += 1;
        }
    }

    /// Removes the entry from `scope` itself. Remapped entries of parent scopes are left alone.
    pub fn unset(&mut self, scope: ScopeId, key: impl Into<Symbol>) -> bool {
        let removed = self
            .scopes
            .get_mut(scope)
            .map_or(false, |bb| bb.entries.remove(&key.into()).is_some());
        if removed {
            self.version += 1;
        }
        removed
    }

    pub fn entry_info(&self, scope: ScopeId, key: impl Into<Symbol>) -> Option<EntryInfo> {
        let (owner, owner_key) = self.resolve_read(scope, key.into())?;
        let entry = &self.scopes[owner].entries[&owner_key];
        Some(EntryInfo {
            type_name: entry.type_name,
            remapped: owner != scope,
            port: entry.port,
        })
    }

    /// Keys stored directly in `scope`, sorted by name.
    pub fn local_keys(&self, scope: ScopeId) -> Vec<Symbol> {
        let mut keys: Vec<_> = self
            .scopes
            .get(scope)
            .map(|bb| bb.entries.keys().copied().collect())
            .unwrap_or_default();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }

    /// Keys of `scope` that resolve in an ancestor, explicitly remapped or
    /// autoremapped, sorted by name. Keys shadowed by a local entry are left out.
    pub fn remapped_keys(&self, scope: ScopeId) -> Vec<Symbol> {
        let Some(bb) = self.scopes.get(scope) else {
            return vec![];
        };
        let mut keys: Vec<Symbol> = bb.remapping.keys().copied().collect();
        if bb.autoremap {
            let mut ancestor = bb.parent;
            while let Some(parent) = ancestor {
                keys.extend(
                    self.local_keys(parent)
                        .into_iter()
                        .filter(|key| !key.starts_with('_')),
                );
                let Some(parent_bb) = self.scopes.get(parent) else {
                    break;
                };
                // Autoremap only reaches further up through autoremapped scopes.
                ancestor = if parent_bb.autoremap { parent_bb.parent } else { None };
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys.dedup();
        keys.retain(|key| {
            !bb.entries.contains_key(key)
                && self
                    .entry_info(scope, *key)
                    .map_or(false, |info| info.remapped)
        });
        keys
    }
}

/// The latest copy of a tree's blackboards, readable from other threads.
///
/// The tree refreshes the copy at the end of each tick, on writes through
/// [`crate::Tree::set`] and before a hook may block, whenever the scopes
/// changed since the last copy.
#[derive(Default)]
pub struct BlackboardMirror {
    latest: Mutex<Option<Blackboards>>,
}

impl BlackboardMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn store(&self, blackboards: &Blackboards) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(blackboards.clone());
    }

    /// Version of the stored copy, if any.
    pub fn version(&self) -> Option<u64> {
        self.with(Blackboards::version)
    }

    /// Runs `f` on the stored copy, if there is one yet.
    pub fn with<R>(&self, f: impl FnOnce(&Blackboards) -> R) -> Option<R> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(f)
    }
}

#[cfg(test)]
mod test;
