//! Cross-kind transactions: per-id updaters applied as one store update.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::{Entity, EntityId, EntityKind, EntityShape};

/// Boxed per-entity updater. Must be total: a panicking updater is a bug at
/// the call site, not something the store recovers from.
pub type Updater = Box<dyn FnOnce(Entity) -> Entity + Send>;

/// A batch of updaters keyed by kind and id.
///
/// Applying it through [`EntityCache::apply_transaction`](crate::EntityCache::apply_transaction)
/// replaces every present entity in one step; there is no rollback.
#[derive(Default)]
pub struct Transaction {
    changes: BTreeMap<EntityKind, BTreeMap<EntityId, Updater>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an updater over the raw entity. A later updater for the same id
    /// replaces an earlier one.
    pub fn update<F>(mut self, kind: EntityKind, id: impl Into<EntityId>, updater: F) -> Self
    where
        F: FnOnce(Entity) -> Entity + Send + 'static,
    {
        self.changes
            .entry(kind)
            .or_default()
            .insert(id.into(), Box::new(updater));
        self
    }

    /// Add an updater over a typed shape.
    ///
    /// An entity that does not parse as `T`, or whose update fails to
    /// serialize, is left as it was.
    pub fn update_as<T, F>(self, id: impl Into<EntityId>, updater: F) -> Self
    where
        T: EntityShape,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.update(T::KIND, id, move |entity| {
            let parsed = match entity.parse::<T>() {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(kind = %T::KIND, id = %entity.id(), error = %e, "transaction skipped entity that failed validation");
                    return entity;
                }
            };
            match Entity::from_shape(&updater(parsed)) {
                Ok(next) => next,
                Err(e) => {
                    warn!(kind = %T::KIND, id = %entity.id(), error = %e, "transaction update did not serialize");
                    entity
                }
            }
        })
    }

    /// Add an updater that edits the JSON body in place.
    pub fn update_value<F>(self, kind: EntityKind, id: impl Into<EntityId>, edit: F) -> Self
    where
        F: FnOnce(&mut Value) + Send + 'static,
    {
        self.update(kind, id, move |entity| {
            let original = entity.clone();
            let mut value = entity.into_value();
            edit(&mut value);
            Entity::from_value(value).unwrap_or(original)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(BTreeMap::is_empty)
    }

    /// Number of updaters across all kinds.
    pub fn len(&self) -> usize {
        self.changes.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn into_changes(self) -> BTreeMap<EntityKind, BTreeMap<EntityId, Updater>> {
        self.changes
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (kind, updaters) in &self.changes {
            map.entry(kind, &updaters.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}
