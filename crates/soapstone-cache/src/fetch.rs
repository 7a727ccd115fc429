//! Single-entity accessors: read the cache, fetch on miss.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tracing::debug;

use crate::{CacheError, Entity, EntityCache, EntityId, EntityShape, Transport};

/// Options for [`EntityQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseEntityOpts {
    /// Fetch on mount even when the entity is cached.
    pub refetch: bool,
    /// When false, mount never touches the network.
    pub enabled: bool,
}

impl Default for UseEntityOpts {
    fn default() -> Self {
        Self {
            refetch: false,
            enabled: true,
        }
    }
}

/// Accessor for one entity by id.
///
/// Concurrent queries for the same id are not deduplicated; each issues its
/// own request and the resulting upserts are idempotent.
pub struct EntityQuery<T> {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    id: EntityId,
    endpoint: String,
    opts: UseEntityOpts,
    fetching: AtomicBool,
    error: AtomicBool,
    _shape: PhantomData<fn() -> T>,
}

impl<T: EntityShape> EntityQuery<T> {
    pub fn new(
        cache: Arc<EntityCache>,
        transport: Arc<dyn Transport>,
        id: impl Into<EntityId>,
        endpoint: impl Into<String>,
        opts: UseEntityOpts,
    ) -> Self {
        Self {
            cache,
            transport,
            id: id.into(),
            endpoint: endpoint.into(),
            opts,
            fetching: AtomicBool::new(false),
            error: AtomicBool::new(false),
            _shape: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The cached entity, if present and valid as `T`.
    pub fn entity(&self) -> Option<T> {
        self.cache.get_as::<T>(&self.id)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    /// Fetching with nothing to show yet, as opposed to refreshing known data.
    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.entity().is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Fetch if the entity is absent (or invalid), or if `refetch` is set.
    pub async fn mount(&self) -> Result<Option<T>, CacheError> {
        let cached = self.entity();
        if !self.opts.enabled || (cached.is_some() && !self.opts.refetch) {
            return Ok(cached);
        }
        self.fetch_entity().await.map(Some)
    }

    /// GET the endpoint and import the response.
    ///
    /// On failure the cache is left as it was and `is_error` is set.
    pub async fn fetch_entity(&self) -> Result<T, CacheError> {
        self.fetching.store(true, Ordering::SeqCst);
        let result = self.request().await;
        self.fetching.store(false, Ordering::SeqCst);
        self.error.store(result.is_err(), Ordering::SeqCst);

        if let Err(e) = &result {
            debug!(kind = %T::KIND, id = %self.id, error = %e, "entity fetch failed");
        }
        result
    }

    async fn request(&self) -> Result<T, CacheError> {
        let response = self.transport.get(&self.endpoint).await?;
        let parsed = T::deserialize(&response.body).map_err(|e| CacheError::schema(T::KIND, e))?;
        if parsed.id() != self.id {
            debug!(kind = %T::KIND, requested = %self.id, returned = %parsed.id(), "server returned a different id");
        }

        let entity = Entity::from_value(response.body)?;
        self.cache.import_entities(vec![entity], T::KIND, None);
        Ok(parsed)
    }
}

/// Accessor for one entity found by a predicate rather than its id, such as
/// an account by `acct`.
pub struct EntityLookup<T, P> {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    endpoint: String,
    predicate: P,
    opts: UseEntityOpts,
    fetching: AtomicBool,
    error: AtomicBool,
    _shape: PhantomData<fn() -> T>,
}

impl<T, P> EntityLookup<T, P>
where
    T: EntityShape,
    P: Fn(&T) -> bool + Send + Sync,
{
    pub fn new(
        cache: Arc<EntityCache>,
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        predicate: P,
        opts: UseEntityOpts,
    ) -> Self {
        Self {
            cache,
            transport,
            endpoint: endpoint.into(),
            predicate,
            opts,
            fetching: AtomicBool::new(false),
            error: AtomicBool::new(false),
            _shape: PhantomData,
        }
    }

    /// The first cached entity of the kind matching the predicate.
    pub fn entity(&self) -> Option<T> {
        self.cache.read(|store| {
            store
                .kind(T::KIND)?
                .entities()
                .filter_map(|e| e.parse::<T>().ok())
                .find(|parsed| (self.predicate)(parsed))
        })
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.entity().is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub async fn mount(&self) -> Result<Option<T>, CacheError> {
        let cached = self.entity();
        if !self.opts.enabled || (cached.is_some() && !self.opts.refetch) {
            return Ok(cached);
        }
        self.fetch_entity().await.map(Some)
    }

    pub async fn fetch_entity(&self) -> Result<T, CacheError> {
        self.fetching.store(true, Ordering::SeqCst);
        let result = async {
            let response = self.transport.get(&self.endpoint).await?;
            let parsed = T::deserialize(&response.body).map_err(|e| CacheError::schema(T::KIND, e))?;
            self.cache
                .import_entities(vec![Entity::from_value(response.body)?], T::KIND, None);
            Ok(parsed)
        }
        .await;
        self.fetching.store(false, Ordering::SeqCst);
        self.error.store(result.is_err(), Ordering::SeqCst);
        result
    }
}
