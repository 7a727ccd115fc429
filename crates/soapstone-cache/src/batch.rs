//! Batched accessor: many id lookups coalesced into one request.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::entity::validate_all;
use crate::store::ListImport;
use crate::{CacheError, EntityCache, EntityId, EntityShape, ListKey};

/// Options for [`BatchedQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseBatchedOpts {
    /// Request every id, cached or not.
    pub force: bool,
    /// When false, mount never touches the network.
    pub enabled: bool,
}

impl Default for UseBatchedOpts {
    fn default() -> Self {
        Self {
            force: false,
            enabled: true,
        }
    }
}

/// Accessor for a set of ids of one kind, fetched together.
///
/// `fetch_many` receives the ids that still need fetching and returns the
/// raw entities. It is called at most once per fetch, and not at all when
/// every id is cached.
pub struct BatchedQuery<T, F> {
    cache: Arc<EntityCache>,
    list_key: ListKey,
    ids: Vec<EntityId>,
    fetch_many: F,
    opts: UseBatchedOpts,
    fetching: AtomicBool,
    error: AtomicBool,
    _shape: PhantomData<fn() -> T>,
}

impl<T, F, Fut> BatchedQuery<T, F>
where
    T: EntityShape,
    F: Fn(Vec<EntityId>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Value>, CacheError>> + Send,
{
    pub fn new<I, S>(cache: Arc<EntityCache>, list_key: ListKey, ids: I, fetch_many: F, opts: UseBatchedOpts) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        let mut seen = HashSet::new();
        let ids = ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &EntityId| seen.insert(id.clone()))
            .collect();

        Self {
            cache,
            list_key,
            ids,
            fetch_many,
            opts,
            fetching: AtomicBool::new(false),
            error: AtomicBool::new(false),
            _shape: PhantomData,
        }
    }

    /// The requested ids, deduplicated in first-seen order.
    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    /// Ids that a fetch would request now.
    pub fn missing_ids(&self) -> Vec<EntityId> {
        if self.opts.force {
            return self.ids.clone();
        }
        self.cache.read(|store| {
            self.ids
                .iter()
                .filter(|id| {
                    store
                        .get(T::KIND, id)
                        .is_none_or(|entity| entity.parse::<T>().is_err())
                })
                .cloned()
                .collect()
        })
    }

    /// Requested ids that are cached and valid, keyed by id.
    pub fn entities(&self) -> HashMap<EntityId, T> {
        self.ids
            .iter()
            .filter_map(|id| self.cache.get_as::<T>(id).map(|entity| (id.clone(), entity)))
            .collect()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.entities().is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub async fn mount(&self) -> Result<HashMap<EntityId, T>, CacheError> {
        if !self.opts.enabled {
            return Ok(self.entities());
        }
        self.fetch().await
    }

    /// Fetch the missing ids in one call and import the results into the list.
    ///
    /// A failed call leaves every cached entity as it was.
    pub async fn fetch(&self) -> Result<HashMap<EntityId, T>, CacheError> {
        let missing = self.missing_ids();
        if missing.is_empty() {
            debug!(kind = %T::KIND, list = %self.list_key, "batch fully cached");
            return Ok(self.entities());
        }

        let requested = missing.len();
        self.fetching.store(true, Ordering::SeqCst);
        self.cache.set_list_loading(&self.list_key, true);

        let result = (self.fetch_many)(missing).await;
        self.fetching.store(false, Ordering::SeqCst);
        self.error.store(result.is_err(), Ordering::SeqCst);

        match result {
            Ok(values) => {
                let entities = validate_all::<T>(values);
                debug!(kind = %T::KIND, list = %self.list_key, requested, received = entities.len(), "batch fetched");
                self.cache
                    .import_into_list(entities, &self.list_key, ListImport::settled());
                Ok(self.entities())
            }
            Err(e) => {
                debug!(kind = %T::KIND, list = %self.list_key, error = %e, "batch fetch failed");
                self.cache.set_list_error(&self.list_key, Some(e.to_string()));
                Err(e)
            }
        }
    }
}
