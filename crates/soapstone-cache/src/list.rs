//! Paginated list accessor.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::entity::validate_all;
use crate::store::{ListImport, ListPlacement};
use crate::{CacheError, EntityCache, EntityList, EntityShape, ListKey, Transport};

/// Options for [`EntitiesQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseEntitiesOpts {
    /// Refetch the first page on mount even when the list was fetched.
    pub refetch: bool,
    /// When false, mount never touches the network.
    pub enabled: bool,
}

impl Default for UseEntitiesOpts {
    fn default() -> Self {
        Self {
            refetch: false,
            enabled: true,
        }
    }
}

/// Accessor for a list fetched page by page.
///
/// The first page replaces the list's ids; later pages append. The cursor
/// for the next page comes from the response and is stored with the list,
/// so every accessor over the same key shares it.
pub struct EntitiesQuery<T> {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    list_key: ListKey,
    endpoint: String,
    opts: UseEntitiesOpts,
    fetching: AtomicBool,
    error: AtomicBool,
    _shape: PhantomData<fn() -> T>,
}

impl<T: EntityShape> EntitiesQuery<T> {
    pub fn new(
        cache: Arc<EntityCache>,
        transport: Arc<dyn Transport>,
        list_key: ListKey,
        endpoint: impl Into<String>,
        opts: UseEntitiesOpts,
    ) -> Self {
        Self {
            cache,
            transport,
            list_key,
            endpoint: endpoint.into(),
            opts,
            fetching: AtomicBool::new(false),
            error: AtomicBool::new(false),
            _shape: PhantomData,
        }
    }

    pub fn list_key(&self) -> &ListKey {
        &self.list_key
    }

    /// The list's entities in order, skipping ids pending removal.
    pub fn entities(&self) -> Vec<T> {
        self.cache.list_entities::<T>(&self.list_key)
    }

    /// The list's ids and fetch state.
    pub fn list(&self) -> Option<EntityList> {
        self.cache.list(&self.list_key)
    }

    pub fn has_next_page(&self) -> bool {
        self.cache
            .read(|store| store.list(&self.list_key).is_some_and(|l| l.next.is_some()))
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    /// Fetching a list that has never been fetched.
    pub fn is_loading(&self) -> bool {
        self.is_fetching()
            && !self
                .cache
                .read(|store| store.list(&self.list_key).is_some_and(|l| l.fetched))
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Fetch the first page unless the list is already fetched (or `refetch`).
    pub async fn mount(&self) -> Result<Vec<T>, CacheError> {
        if !self.opts.enabled {
            return Ok(self.entities());
        }
        let fetched = self
            .cache
            .read(|store| store.list(&self.list_key).is_some_and(|l| l.fetched));
        if fetched && !self.opts.refetch {
            return Ok(self.entities());
        }
        self.fetch_entities().await
    }

    /// Fetch the first page, replacing the list's ids and cursor.
    pub async fn fetch_entities(&self) -> Result<Vec<T>, CacheError> {
        self.fetch_page(&self.endpoint, ListPlacement::Replace).await?;
        Ok(self.entities())
    }

    /// Append the next page. Returns false when there is no next page or a
    /// request for this accessor is already in flight.
    pub async fn fetch_next_page(&self) -> Result<bool, CacheError> {
        let next = self
            .cache
            .read(|store| store.list(&self.list_key).and_then(|l| l.next.clone()));
        let Some(next) = next else {
            return Ok(false);
        };
        if self.is_fetching() {
            debug!(list = %self.list_key, "next page requested while fetching, ignored");
            return Ok(false);
        }
        self.fetch_page(&next, ListPlacement::End).await?;
        Ok(true)
    }

    /// Drop the list's ids and cursor and fetch it again from the start.
    ///
    /// Entities stay in `byId`.
    pub async fn invalidate(&self) -> Result<Vec<T>, CacheError> {
        self.cache.invalidate_list(&self.list_key);
        self.fetch_entities().await
    }

    async fn fetch_page(&self, endpoint: &str, placement: ListPlacement) -> Result<(), CacheError> {
        self.fetching.store(true, Ordering::SeqCst);
        self.cache.set_list_loading(&self.list_key, true);

        let result = async {
            let (values, next) = self.transport.get(endpoint).await?.into_page()?;
            Ok::<_, CacheError>((validate_all::<T>(values), next))
        }
        .await;

        self.fetching.store(false, Ordering::SeqCst);
        self.error.store(result.is_err(), Ordering::SeqCst);

        match result {
            Ok((entities, next)) => {
                debug!(
                    list = %self.list_key,
                    count = entities.len(),
                    has_next = next.is_some(),
                    "list page fetched"
                );
                self.cache
                    .import_into_list(entities, &self.list_key, ListImport::page(placement, next));
                Ok(())
            }
            Err(e) => {
                debug!(list = %self.list_key, error = %e, "list page fetch failed");
                self.cache.set_list_error(&self.list_key, Some(e.to_string()));
                Err(e)
            }
        }
    }
}
