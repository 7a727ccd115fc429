//! Normalized store: per-kind id maps plus ordered id lists.
//!
//! Every mutation is one of the transitions below. They are synchronous,
//! deterministic, and touch nothing outside the [`Store`] value, so the
//! shared [`EntityCache`](crate::EntityCache) can run each of them as a
//! single indivisible update.

use std::collections::{HashMap, HashSet};

use tracing::{trace, warn};

use crate::{Entity, EntityId, EntityKind, ListKey, Transaction};

/// Ordered view over the ids of one kind, with its own fetch state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityList {
    ids: Vec<EntityId>,
    /// The list has been requested at least once.
    pub fetched: bool,
    /// A request for this list is in flight.
    pub loading: bool,
    /// Message of the last failed request, cleared on success.
    pub error: Option<String>,
    /// Opaque cursor for the next page.
    pub next: Option<String>,
}

impl EntityList {
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Add ids that are not yet listed, in first-seen order.
    fn insert(&mut self, ids: Vec<EntityId>, placement: ListPlacement) {
        let mut seen: HashSet<EntityId> = match placement {
            ListPlacement::Replace => HashSet::new(),
            _ => self.ids.iter().cloned().collect(),
        };
        let fresh: Vec<EntityId> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();

        match placement {
            ListPlacement::End => self.ids.extend(fresh),
            ListPlacement::Start => {
                let mut ids = fresh;
                ids.append(&mut self.ids);
                self.ids = ids;
            }
            ListPlacement::Replace => self.ids = fresh,
        }
    }

    fn remove(&mut self, ids: &HashSet<&str>) -> bool {
        let before = self.ids.len();
        self.ids.retain(|id| !ids.contains(id.as_str()));
        before != self.ids.len()
    }
}

/// Where imported ids go in a list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListPlacement {
    /// Append after the existing ids.
    #[default]
    End,
    /// Prepend before the existing ids.
    Start,
    /// Drop the existing ids first.
    Replace,
}

/// How a list import is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListImport {
    pub placement: ListPlacement,
    /// Cursor for the page after this one, if the import came from a page.
    pub next: Option<String>,
    /// Overwrite the stored cursor with `next` even when it is `None`.
    pub update_next: bool,
    /// The import settles a request for this list: clear `loading` and `error`.
    pub settles_fetch: bool,
}

impl ListImport {
    /// A fetched page whose successor is `next`.
    pub fn page(placement: ListPlacement, next: Option<String>) -> Self {
        Self {
            placement,
            next,
            update_next: true,
            settles_fetch: true,
        }
    }

    /// The result of a request that does not page, e.g. a batch lookup.
    pub fn settled() -> Self {
        Self {
            settles_fetch: true,
            ..Self::default()
        }
    }
}

/// Options for [`Store::delete_entities`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Leave list membership untouched, producing listed-but-missing ids.
    pub preserve_lists: bool,
}

/// Entities and lists of a single kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindStore {
    by_id: HashMap<EntityId, Entity>,
    lists: HashMap<ListKey, EntityList>,
}

impl KindStore {
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id)
    }

    pub fn list(&self, key: &ListKey) -> Option<&EntityList> {
        self.lists.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.by_id.values()
    }

    pub fn lists(&self) -> impl Iterator<Item = (&ListKey, &EntityList)> {
        self.lists.iter()
    }
}

/// The whole cache: `EntityKind → KindStore`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Store {
    kinds: HashMap<EntityKind, KindStore>,
    account: Option<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self, kind: EntityKind) -> Option<&KindStore> {
        self.kinds.get(&kind)
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.kinds.get(&kind).and_then(|k| k.get(id))
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn list(&self, key: &ListKey) -> Option<&EntityList> {
        self.kinds.get(&key.kind()).and_then(|k| k.list(key))
    }

    /// The account the stored data belongs to, if one has been bound.
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindStore {
        self.kinds.entry(kind).or_default()
    }

    fn list_mut(&mut self, key: &ListKey) -> &mut EntityList {
        self.kind_mut(key.kind()).lists.entry(key.clone()).or_default()
    }

    /// Upsert `entities` and, with `list`, append their ids to that list.
    ///
    /// Existing ids are replaced wholesale, never merged. The list is marked
    /// fetched even when `entities` is empty.
    pub fn import_entities(
        &mut self,
        entities: Vec<Entity>,
        kind: EntityKind,
        list: Option<&ListKey>,
    ) {
        match list {
            Some(key) => self.import_into_list(entities, kind, key, ListImport::default()),
            None => {
                let count = entities.len();
                self.upsert(entities, kind);
                trace!(%kind, count, "store: entities imported");
            }
        }
    }

    /// Import a page of entities into `key` with explicit placement and cursor.
    pub fn import_into_list(
        &mut self,
        entities: Vec<Entity>,
        kind: EntityKind,
        key: &ListKey,
        import: ListImport,
    ) {
        if key.kind() != kind {
            warn!(%kind, list = %key, "importing into a list of another kind");
        }

        let ids = self.upsert(entities, kind);
        let count = ids.len();

        let list = self
            .kind_mut(kind)
            .lists
            .entry(key.clone())
            .or_default();
        list.insert(ids, import.placement);
        list.fetched = true;
        if import.settles_fetch {
            list.loading = false;
            list.error = None;
        }
        if import.update_next || import.next.is_some() {
            list.next = import.next;
        }

        trace!(%kind, list = %key, count, placement = ?import.placement, "store: entities imported into list");
    }

    /// Import a newly created entity, prepending it to `key` only if that
    /// list has been fetched. Returns whether it was listed.
    ///
    /// An unfetched list is left alone so its first page still gets fetched.
    pub fn import_created(&mut self, entity: Entity, key: &ListKey) -> bool {
        let kind = key.kind();
        let listed = self.list(key).is_some_and(|l| l.fetched);
        let ids = self.upsert(vec![entity], kind);
        if listed {
            self.list_mut(key).insert(ids, ListPlacement::Start);
        }
        trace!(%kind, list = %key, listed, "store: created entity imported");
        listed
    }

    fn upsert(&mut self, entities: Vec<Entity>, kind: EntityKind) -> Vec<EntityId> {
        let by_id = &mut self.kind_mut(kind).by_id;
        entities
            .into_iter()
            .map(|entity| {
                let id = entity.id().to_string();
                by_id.insert(id.clone(), entity);
                id
            })
            .collect()
    }

    /// Remove `ids` from `byId` and, unless preserved, from every list of `kind`.
    pub fn delete_entities<S: AsRef<str>>(
        &mut self,
        ids: &[S],
        kind: EntityKind,
        opts: DeleteOptions,
    ) {
        let Some(store) = self.kinds.get_mut(&kind) else {
            return;
        };

        let ids: HashSet<&str> = ids.iter().map(AsRef::as_ref).collect();
        for id in &ids {
            store.by_id.remove(*id);
        }

        if !opts.preserve_lists {
            for list in store.lists.values_mut() {
                list.remove(&ids);
            }
        }

        trace!(%kind, count = ids.len(), preserve_lists = opts.preserve_lists, "store: entities deleted");
    }

    /// Replace every present id with its updater's result.
    ///
    /// Absent ids are skipped. Returns the `(kind, id)` pairs that changed.
    pub fn apply_transaction(&mut self, tx: Transaction) -> Vec<(EntityKind, EntityId)> {
        let mut changed = Vec::new();

        for (kind, updaters) in tx.into_changes() {
            let Some(store) = self.kinds.get_mut(&kind) else {
                continue;
            };
            for (id, updater) in updaters {
                let Some(slot) = store.by_id.get_mut(&id) else {
                    continue;
                };
                let next = updater(slot.clone());
                if next.id() != id {
                    // Re-keying would break the byId invariant.
                    warn!(%kind, id = %id, new_id = %next.id(), "transaction updater changed entity id, skipped");
                    continue;
                }
                *slot = next;
                changed.push((kind, id));
            }
        }

        trace!(count = changed.len(), "store: transaction applied");
        changed
    }

    /// Record whether a request for `key` is in flight.
    pub fn set_list_loading(&mut self, key: &ListKey, loading: bool) {
        self.list_mut(key).loading = loading;
    }

    /// Record a failed request for `key`, clearing its loading flag.
    pub fn set_list_error(&mut self, key: &ListKey, error: Option<String>) {
        let list = self.list_mut(key);
        list.loading = false;
        list.error = error;
    }

    /// Forget a list's ids and fetch state; entities stay in `byId`.
    pub fn invalidate_list(&mut self, key: &ListKey) {
        if let Some(store) = self.kinds.get_mut(&key.kind()) {
            store.lists.remove(key);
        }
    }

    /// Drop every entity and list.
    pub fn clear(&mut self) {
        self.kinds.clear();
    }

    /// Bind the store to `account`, clearing it if a different account was bound.
    ///
    /// Returns true if the store was cleared.
    pub fn bind_account(&mut self, account: &str) -> bool {
        match self.account.as_deref() {
            Some(current) if current == account => false,
            Some(_) => {
                self.clear();
                self.account = Some(account.to_string());
                true
            }
            None => {
                self.account = Some(account.to_string());
                false
            }
        }
    }
}
