//! To-many (`Set`) attribute state, the equivalent of the original's
//! `SetData`/`Set`/`SetWrapper` trio, collapsed into one erased type since
//! the engine never materializes a typed collection wrapper for the user —
//! `corm-macros` generates the typed accessor, this is what it talks to.

use crate::instance::InstanceId;
use std::collections::HashSet;

/// The materialized state of one `Set` attribute on one instance.
///
/// `current` holds every member known to this session; it is authoritative
/// only once `is_fully_loaded` is set (by a query that loaded the whole
/// collection). `added`/`removed` are the deltas to flush, and are always
/// disjoint: adding a previously removed id clears it from `removed`
/// instead of appearing in both.
#[derive(Debug, Clone, Default)]
pub struct SetData {
    current: HashSet<InstanceId>,
    added: HashSet<InstanceId>,
    removed: HashSet<InstanceId>,
    is_fully_loaded: bool,
}

impl SetData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.is_fully_loaded
    }

    pub fn mark_fully_loaded(&mut self) {
        self.is_fully_loaded = true;
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.current.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.current.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Adds `id`, returning `false` if it was already a member.
    pub fn add(&mut self, id: InstanceId) -> bool {
        if self.removed.remove(&id) {
            self.current.insert(id);
            return true;
        }
        if !self.current.insert(id) {
            return false;
        }
        self.added.insert(id);
        true
    }

    /// Loads `id` as a pre-existing member without recording it as a delta,
    /// for hydrating a `SetData` from a query result.
    pub fn seed(&mut self, id: InstanceId) {
        self.current.insert(id);
    }

    /// Removes `id`, returning `false` if it was not a member.
    pub fn remove(&mut self, id: InstanceId) -> bool {
        if self.added.remove(&id) {
            self.current.remove(&id);
            return true;
        }
        if !self.current.remove(&id) {
            return false;
        }
        self.removed.insert(id);
        true
    }

    pub fn added(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.added.iter().copied()
    }

    pub fn removed(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.removed.iter().copied()
    }

    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Called after a successful flush: the deltas are now reflected in the
    /// database, so they reset without touching `current`.
    pub fn reset_deltas(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}
