//! Shared, observable entity cache.
//!
//! The [`Store`] lives inside a `watch` channel: each transition runs inside
//! one `send_modify`, so readers always borrow a state in which a transition
//! has either fully applied or not at all, and watchers are woken once per
//! transition. Typed change events go out on a separate broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::store::{DeleteOptions, ListImport};
use crate::{Entity, EntityId, EntityKind, EntityList, EntityShape, ListKey, Store, Transaction};

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 4096;

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// Entities were upserted, optionally into a list.
    Imported {
        kind: EntityKind,
        ids: Vec<EntityId>,
        list: Option<ListKey>,
    },
    /// Entities were removed.
    Deleted {
        kind: EntityKind,
        ids: Vec<EntityId>,
        preserve_lists: bool,
    },
    /// A transaction replaced these entities.
    TransactionApplied { changed: Vec<(EntityKind, EntityId)> },
    /// A list's fetch state changed or it was invalidated.
    ListChanged { list: ListKey },
    /// Everything was dropped (account switch or explicit clear).
    Cleared,
}

/// In-memory cache for every fetched server object.
///
/// Created once per session and shared behind an `Arc`.
pub struct EntityCache {
    store: watch::Sender<Store>,
    updates_tx: broadcast::Sender<CacheUpdate>,
    revision: AtomicU64,
}

impl EntityCache {
    /// Create a new empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Watch the whole store. The receiver is marked changed after every transition.
    pub fn subscribe(&self) -> watch::Receiver<Store> {
        self.store.subscribe()
    }

    /// Subscribe to typed change events.
    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    pub(crate) fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }

    /// Run `f` against a consistent view of the store.
    ///
    /// Do not hold up the closure: transitions wait for it.
    pub fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store.borrow())
    }

    /// Clone the current store.
    pub fn snapshot(&self) -> Store {
        self.store.borrow().clone()
    }

    /// Number of store updates applied so far.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Apply a transition as one update.
    pub(crate) fn modify<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut out = None;
        self.store.send_modify(|store| {
            out = Some(f(store));
            self.revision.fetch_add(1, Ordering::SeqCst);
        });
        match out {
            Some(out) => out,
            None => unreachable!("send_modify runs its closure exactly once"),
        }
    }

    /// Get a stored entity.
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.read(|store| store.get(kind, id).cloned())
    }

    /// Get a stored entity through its typed shape.
    ///
    /// A stored body that fails to parse is reported as absent.
    pub fn get_as<T: EntityShape>(&self, id: &str) -> Option<T> {
        self.read(|store| {
            let entity = store.get(T::KIND, id)?;
            match entity.parse::<T>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    debug!(kind = %T::KIND, id = %id, error = %e, "cached entity failed validation, treating as absent");
                    None
                }
            }
        })
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.read(|store| store.contains(kind, id))
    }

    /// Get the number of cached entities of a kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.read(|store| store.kind(kind).map_or(0, |k| k.len()))
    }

    /// Clone a list, ids and fetch state.
    pub fn list(&self, key: &ListKey) -> Option<EntityList> {
        self.read(|store| store.list(key).cloned())
    }

    /// Resolve a list through `byId` and the typed shape.
    ///
    /// Listed ids that are missing (pending removal) or fail validation are
    /// skipped.
    pub fn list_entities<T: EntityShape>(&self, key: &ListKey) -> Vec<T> {
        self.read(|store| {
            let Some(list) = store.list(key) else {
                return Vec::new();
            };
            list.ids()
                .iter()
                .filter_map(|id| store.get(T::KIND, id))
                .filter_map(|entity| entity.parse::<T>().ok())
                .collect()
        })
    }

    /// Upsert entities and, with `list`, append them to that list.
    pub fn import_entities(&self, entities: Vec<Entity>, kind: EntityKind, list: Option<&ListKey>) {
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id().to_string()).collect();
        self.modify(|store| store.import_entities(entities, kind, list));
        self.broadcast(CacheUpdate::Imported {
            kind,
            ids,
            list: list.cloned(),
        });
    }

    /// Import a fetched page into a list with explicit placement and cursor.
    pub fn import_into_list(&self, entities: Vec<Entity>, key: &ListKey, import: ListImport) {
        let kind = key.kind();
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id().to_string()).collect();
        self.modify(|store| store.import_into_list(entities, kind, key, import));
        self.broadcast(CacheUpdate::Imported {
            kind,
            ids,
            list: Some(key.clone()),
        });
    }

    /// Import a created entity, prepending it to `key` if that list was fetched.
    pub fn import_created(&self, entity: Entity, key: &ListKey) -> bool {
        let id = entity.id().to_string();
        let listed = self.modify(|store| store.import_created(entity, key));
        self.broadcast(CacheUpdate::Imported {
            kind: key.kind(),
            ids: vec![id],
            list: listed.then(|| key.clone()),
        });
        listed
    }

    /// Remove entities, and unless `preserve_lists`, their list membership.
    pub fn delete_entities<S: AsRef<str>>(&self, ids: &[S], kind: EntityKind, opts: DeleteOptions) {
        self.modify(|store| store.delete_entities(ids, kind, opts));
        self.broadcast(CacheUpdate::Deleted {
            kind,
            ids: ids.iter().map(|id| id.as_ref().to_string()).collect(),
            preserve_lists: opts.preserve_lists,
        });
    }

    /// Apply every updater of `tx` in a single store update.
    ///
    /// Returns the `(kind, id)` pairs that were present and replaced.
    pub fn apply_transaction(&self, tx: Transaction) -> Vec<(EntityKind, EntityId)> {
        let changed = self.modify(|store| store.apply_transaction(tx));
        if !changed.is_empty() {
            self.broadcast(CacheUpdate::TransactionApplied {
                changed: changed.clone(),
            });
        }
        changed
    }

    /// Replace a present entity with `transform(current)`.
    ///
    /// No network call and no rollback. Returns false if the id is absent or
    /// fails validation as `T`.
    pub fn change_entity<T, F>(&self, id: &str, transform: F) -> bool
    where
        T: EntityShape,
        F: FnOnce(T) -> T,
    {
        let Some(current) = self.get_as::<T>(id) else {
            return false;
        };
        match Entity::from_shape(&transform(current)) {
            Ok(next) if next.id() == id => {
                self.import_entities(vec![next], T::KIND, None);
                true
            }
            Ok(next) => {
                debug!(kind = %T::KIND, id = %id, new_id = %next.id(), "change_entity transform changed id, ignored");
                false
            }
            Err(e) => {
                debug!(kind = %T::KIND, id = %id, error = %e, "change_entity result is not storable");
                false
            }
        }
    }

    /// Record whether a request for `key` is in flight.
    pub fn set_list_loading(&self, key: &ListKey, loading: bool) {
        self.modify(|store| store.set_list_loading(key, loading));
        self.broadcast(CacheUpdate::ListChanged { list: key.clone() });
    }

    /// Record a failed request for `key`.
    pub fn set_list_error(&self, key: &ListKey, error: Option<String>) {
        self.modify(|store| store.set_list_error(key, error));
        self.broadcast(CacheUpdate::ListChanged { list: key.clone() });
    }

    /// Forget a list so the next accessor mount refetches it.
    pub fn invalidate_list(&self, key: &ListKey) {
        self.modify(|store| store.invalidate_list(key));
        self.broadcast(CacheUpdate::ListChanged { list: key.clone() });
    }

    /// Clear all cached data.
    pub fn clear(&self) {
        self.modify(Store::clear);
        self.broadcast(CacheUpdate::Cleared);
        debug!("cache cleared");
    }

    /// Bind the cache to the signed-in account.
    ///
    /// Switching to a different account drops everything cached for the
    /// previous one. Returns true if the cache was cleared.
    pub fn switch_account(&self, account_id: &str) -> bool {
        let cleared = self.modify(|store| store.bind_account(account_id));
        if cleared {
            self.broadcast(CacheUpdate::Cleared);
            debug!(account = %account_id, "account switched, cache cleared");
        }
        cleared
    }

    /// The account the cache is bound to.
    pub fn account(&self) -> Option<String> {
        self.read(|store| store.account().map(str::to_string))
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        let (store, _) = watch::channel(Store::default());
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self {
            store,
            updates_tx,
            revision: AtomicU64::new(0),
        }
    }
}
