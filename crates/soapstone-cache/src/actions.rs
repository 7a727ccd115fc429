//! Create/delete against the server while keeping the cache consistent.
//!
//! Creates are pessimistic: nothing changes locally until the server answers.
//! Deletes are optimistic: the entity is hidden first, then either removed
//! for good or restored from a snapshot once the request settles.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::DeleteOptions;
use crate::{CacheError, Entity, EntityCache, EntityKind, EntityShape, ListKey, Transaction, Transport};

/// Endpoints an [`EntityActions`] may call. A delete template's `:id` is
/// replaced by the entity id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityEndpoints {
    pub create: Option<String>,
    pub delete: Option<String>,
}

impl EntityEndpoints {
    pub fn create(mut self, endpoint: impl Into<String>) -> Self {
        self.create = Some(endpoint.into());
        self
    }

    pub fn delete(mut self, endpoint: impl Into<String>) -> Self {
        self.delete = Some(endpoint.into());
        self
    }
}

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&CacheError) + Send>;

/// Optional hooks run when a mutation settles.
pub struct EntityCallbacks<T> {
    on_success: Option<SuccessCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> EntityCallbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&CacheError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn settle<R>(self, result: Result<R, CacheError>, value: impl FnOnce(&R) -> &T) -> Result<R, CacheError> {
        match &result {
            Ok(r) => {
                if let Some(f) = self.on_success {
                    f(value(r));
                }
            }
            Err(e) => {
                if let Some(f) = self.on_error {
                    f(e);
                }
            }
        }
        result
    }
}

impl<T> Default for EntityCallbacks<T> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created<T> {
    /// The response body as sent by the server.
    pub response: Value,
    pub entity: T,
}

/// An entity hidden from lookups while its delete is in flight.
///
/// The list membership is left alone, so lists render a gap. Exactly one of
/// [`finalize`](Self::finalize) or [`restore`](Self::restore) ends it.
#[must_use = "a hidden entity must be finalized or restored"]
struct OptimisticDelete<'a> {
    cache: &'a EntityCache,
    kind: EntityKind,
    id: String,
    snapshot: Option<Entity>,
}

impl<'a> OptimisticDelete<'a> {
    fn begin(cache: &'a EntityCache, kind: EntityKind, id: &str) -> Self {
        let snapshot = cache.get(kind, id);
        cache.delete_entities(
            &[id],
            kind,
            DeleteOptions {
                preserve_lists: true,
            },
        );
        Self {
            cache,
            kind,
            id: id.to_string(),
            snapshot,
        }
    }

    /// The server confirmed: drop the id from every list too.
    fn finalize(self) {
        self.cache
            .delete_entities(&[&self.id], self.kind, DeleteOptions::default());
    }

    /// The server refused: put the snapshot back where it was.
    fn restore(self) {
        match self.snapshot {
            Some(snapshot) => {
                warn!(kind = %self.kind, id = %self.id, "delete failed, restoring entity");
                self.cache.import_entities(vec![snapshot], self.kind, None);
            }
            None => debug!(kind = %self.kind, id = %self.id, "delete failed, nothing cached to restore"),
        }
    }
}

/// Decrements the in-flight counter when the mutation settles.
struct Submitting<'a>(&'a AtomicUsize);

impl<'a> Submitting<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Submitting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Create and delete entities of one kind.
pub struct EntityActions<T> {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    list_key: Option<ListKey>,
    endpoints: EntityEndpoints,
    submitting: AtomicUsize,
    _shape: PhantomData<fn() -> T>,
}

impl<T: EntityShape> EntityActions<T> {
    pub fn new(
        cache: Arc<EntityCache>,
        transport: Arc<dyn Transport>,
        list_key: Option<ListKey>,
        endpoints: EntityEndpoints,
    ) -> Self {
        Self {
            cache,
            transport,
            list_key,
            endpoints,
            submitting: AtomicUsize::new(0),
            _shape: PhantomData,
        }
    }

    /// Whether a create or delete of this controller is in flight.
    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst) > 0
    }

    /// POST `params` and import the created entity.
    ///
    /// The entity is prepended to the list only once that list has been
    /// fetched; before that, its first page is still to come.
    pub async fn create_entity<P: Serialize + ?Sized>(
        &self,
        params: &P,
        callbacks: EntityCallbacks<T>,
    ) -> Result<Created<T>, CacheError> {
        let endpoint = self
            .endpoints
            .create
            .as_deref()
            .ok_or(CacheError::MissingEndpoint("create"))?;

        let _submitting = Submitting::start(&self.submitting);
        let result = self.post(endpoint, params).await;
        callbacks.settle(result, |created| &created.entity)
    }

    async fn post<P: Serialize + ?Sized>(&self, endpoint: &str, params: &P) -> Result<Created<T>, CacheError> {
        let body = serde_json::to_value(params)?;
        let response = self.transport.post(endpoint, &body).await?.body;

        let entity = T::deserialize(&response).map_err(|e| CacheError::schema(T::KIND, e))?;
        let stored = Entity::from_value(response.clone())?;

        let listed = match &self.list_key {
            Some(key) => self.cache.import_created(stored, key),
            None => {
                self.cache.import_entities(vec![stored], T::KIND, None);
                false
            }
        };
        debug!(kind = %T::KIND, id = %entity.id(), listed, "entity created");

        Ok(Created { response, entity })
    }

    /// Hide the entity, DELETE it, then finalize or restore.
    ///
    /// On failure the entity and its list positions are exactly as they were
    /// before the call, and the error is returned.
    pub async fn delete_entity(&self, id: &str, callbacks: EntityCallbacks<()>) -> Result<(), CacheError> {
        let endpoint = self
            .endpoints
            .delete
            .as_deref()
            .ok_or(CacheError::MissingEndpoint("delete"))?
            .replace(":id", id);

        let _submitting = Submitting::start(&self.submitting);
        let hidden = OptimisticDelete::begin(&self.cache, T::KIND, id);

        let result = match self.transport.delete(&endpoint).await {
            Ok(_) => {
                hidden.finalize();
                debug!(kind = %T::KIND, id = %id, "entity deleted");
                Ok(())
            }
            Err(e) => {
                hidden.restore();
                Err(e)
            }
        };
        callbacks.settle(result, |unit| unit)
    }
}

/// Replace cached entities of one kind locally, with no request and no rollback.
pub struct ChangeEntity<T> {
    cache: Arc<EntityCache>,
    _shape: PhantomData<fn() -> T>,
}

impl<T: EntityShape> ChangeEntity<T> {
    pub fn new(cache: Arc<EntityCache>) -> Self {
        Self {
            cache,
            _shape: PhantomData,
        }
    }

    /// Returns false if `id` is not cached as a valid `T`.
    pub fn change_entity(&self, id: &str, transform: impl FnOnce(T) -> T) -> bool {
        self.cache.change_entity::<T, _>(id, transform)
    }
}

/// Apply `forward`, await `request`, and apply `inverse` if it fails.
///
/// Both transactions are applied atomically; `inverse` must undo `forward`
/// for every id it touches.
pub async fn optimistic_transaction<R, Fut>(
    cache: &EntityCache,
    forward: Transaction,
    inverse: Transaction,
    request: Fut,
) -> Result<R, CacheError>
where
    Fut: Future<Output = Result<R, CacheError>>,
{
    let applied = cache.apply_transaction(forward);
    debug!(changed = applied.len(), "optimistic transaction applied");

    match request.await {
        Ok(r) => Ok(r),
        Err(e) => {
            let reverted = cache.apply_transaction(inverse);
            warn!(changed = reverted.len(), error = %e, "request failed, optimistic transaction reverted");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Method, MockTransport};
    use crate::{Account, Status};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn blocks() -> ListKey {
        ListKey::new(EntityKind::Accounts, ["blocks"])
    }

    fn seed(cache: &EntityCache) {
        let accounts = ["1", "2", "3"]
            .iter()
            .map(|id| Entity::from_value(json!({"id": id, "acct": format!("user{}", id)})).unwrap())
            .collect();
        cache.import_entities(accounts, EntityKind::Accounts, Some(&blocks()));
    }

    fn actions(cache: &Arc<EntityCache>, transport: Arc<MockTransport>) -> EntityActions<Account> {
        EntityActions::new(
            Arc::clone(cache),
            transport,
            Some(blocks()),
            EntityEndpoints::default()
                .create("/api/v1/blocks")
                .delete("/api/v1/blocks/:id"),
        )
    }

    #[tokio::test]
    async fn test_create_prepends_to_list() {
        let cache = EntityCache::new();
        seed(&cache);
        let transport = Arc::new(MockTransport::new().reply_json(
            Method::Post,
            "/api/v1/blocks",
            json!({"id": "9", "acct": "mallory", "note": "kept"}),
        ));
        let actions = actions(&cache, Arc::clone(&transport));

        let seen = Arc::new(Mutex::new(None));
        let recorded = Arc::clone(&seen);
        let created = actions
            .create_entity(
                &json!({"account_id": "9"}),
                EntityCallbacks::new().on_success(move |a: &Account| *recorded.lock().unwrap() = Some(a.acct.clone())),
            )
            .await
            .unwrap();

        assert_eq!(created.entity.acct, "mallory");
        assert_eq!(created.response["note"], "kept");
        assert_eq!(seen.lock().unwrap().as_deref(), Some("mallory"));
        assert_eq!(cache.list(&blocks()).unwrap().ids(), &["9", "1", "2", "3"]);
        assert_eq!(transport.calls()[0].2, Some(json!({"account_id": "9"})));
        assert!(!actions.is_submitting());
    }

    #[tokio::test]
    async fn test_create_before_first_page_leaves_list_unfetched() {
        let cache = EntityCache::new();
        let transport = Arc::new(
            MockTransport::new()
                .reply_json(Method::Post, "/api/v1/blocks", json!({"id": "9", "acct": "mallory"}))
                .reply_json(
                    Method::Get,
                    "/api/v1/blocks",
                    json!([
                        {"id": "9", "acct": "mallory"},
                        {"id": "1", "acct": "user1"},
                        {"id": "2", "acct": "user2"},
                    ]),
                ),
        );
        let actions = actions(&cache, Arc::clone(&transport));

        actions.create_entity(&json!({}), EntityCallbacks::new()).await.unwrap();
        assert!(cache.contains(EntityKind::Accounts, "9"));
        assert!(cache.list(&blocks()).is_none());

        let query = crate::EntitiesQuery::<Account>::new(
            Arc::clone(&cache),
            Arc::clone(&transport) as Arc<dyn Transport>,
            blocks(),
            "/api/v1/blocks",
            crate::UseEntitiesOpts::default(),
        );
        let shown: Vec<String> = query.mount().await.unwrap().into_iter().map(|a| a.id).collect();

        assert_eq!(shown, vec!["9", "1", "2"]);
        assert_eq!(transport.call_count(Method::Get, "/api/v1/blocks"), 1);
    }

    #[tokio::test]
    async fn test_create_keeps_list_fetch_state() {
        let cache = EntityCache::new();
        seed(&cache);
        cache.set_list_loading(&blocks(), true);
        let transport = Arc::new(MockTransport::new().reply_json(
            Method::Post,
            "/api/v1/blocks",
            json!({"id": "9", "acct": "mallory"}),
        ));
        let actions = actions(&cache, transport);

        actions.create_entity(&json!({}), EntityCallbacks::new()).await.unwrap();

        let list = cache.list(&blocks()).unwrap();
        assert!(list.loading);
        assert_eq!(list.ids(), &["9", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_create_failure_changes_nothing() {
        let cache = EntityCache::new();
        seed(&cache);
        let before = cache.snapshot();
        let transport = Arc::new(MockTransport::new().fail(Method::Post, "/api/v1/blocks", 422, "invalid"));
        let actions = actions(&cache, transport);

        let errored = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&errored);
        let result = actions
            .create_entity(
                &json!({}),
                EntityCallbacks::new().on_error(move |_| *flag.lock().unwrap() = true),
            )
            .await;

        assert!(result.is_err());
        assert!(*errored.lock().unwrap());
        assert_eq!(cache.snapshot(), before);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_response() {
        let cache = EntityCache::new();
        let transport = Arc::new(MockTransport::new().reply_json(Method::Post, "/api/v1/blocks", json!({"id": "9"})));
        let actions = actions(&cache, transport);

        let err = actions.create_entity(&json!({}), EntityCallbacks::new()).await.unwrap_err();
        assert!(matches!(err, CacheError::Schema { kind: EntityKind::Accounts, .. }));
        assert_eq!(cache.count(EntityKind::Accounts), 0);
    }

    #[tokio::test]
    async fn test_missing_endpoints() {
        let cache = EntityCache::new();
        seed(&cache);
        let transport = Arc::new(MockTransport::new());
        let actions =
            EntityActions::<Account>::new(Arc::clone(&cache), Arc::clone(&transport) as Arc<dyn Transport>, None, EntityEndpoints::default());

        assert!(matches!(
            actions.create_entity(&json!({}), EntityCallbacks::new()).await,
            Err(CacheError::MissingEndpoint("create"))
        ));
        assert!(matches!(
            actions.delete_entity("1", EntityCallbacks::new()).await,
            Err(CacheError::MissingEndpoint("delete"))
        ));
        assert!(cache.contains(EntityKind::Accounts, "1"));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_success_finalizes() {
        let cache = EntityCache::new();
        seed(&cache);
        let transport = Arc::new(MockTransport::new().reply_json(Method::Delete, "/api/v1/blocks/2", json!({})));
        let actions = actions(&cache, transport);

        let done = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&done);
        actions
            .delete_entity("2", EntityCallbacks::new().on_success(move |_| *flag.lock().unwrap() = true))
            .await
            .unwrap();

        assert!(*done.lock().unwrap());
        assert!(!cache.contains(EntityKind::Accounts, "2"));
        assert_eq!(cache.list(&blocks()).unwrap().ids(), &["1", "3"]);
    }

    #[tokio::test]
    async fn test_delete_failure_restores_snapshot_and_position() {
        let cache = EntityCache::new();
        seed(&cache);
        let before = cache.snapshot();

        let during = Arc::new(Mutex::new(None));
        let observer = Arc::clone(&cache);
        let record = Arc::clone(&during);
        let transport = Arc::new(
            MockTransport::new()
                .on_call(move |_, _| {
                    let state = observer.read(|store| {
                        (
                            store.contains(EntityKind::Accounts, "2"),
                            store.list(&blocks()).map(|l| l.ids().to_vec()),
                        )
                    });
                    *record.lock().unwrap() = Some(state);
                })
                .fail(Method::Delete, "/api/v1/blocks/2", 500, "oops"),
        );
        let actions = actions(&cache, transport);

        let err = actions
            .delete_entity("2", EntityCallbacks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Api { status: 500, .. }));

        // Hidden from lookups while the request was in flight, still listed.
        let (present, listed) = during.lock().unwrap().clone().unwrap();
        assert!(!present);
        assert_eq!(listed.unwrap(), vec!["1", "2", "3"]);

        assert_eq!(cache.snapshot(), before);
        assert_eq!(cache.list(&blocks()).unwrap().ids(), &["1", "2", "3"]);
        assert!(!actions.is_submitting());
    }

    #[tokio::test]
    async fn test_submitting_while_in_flight() {
        let cache = EntityCache::new();
        seed(&cache);

        let slot: Arc<std::sync::OnceLock<Arc<EntityActions<Account>>>> = Arc::new(std::sync::OnceLock::new());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let hook_slot = Arc::clone(&slot);
        let seen = Arc::clone(&observed);
        let transport = Arc::new(
            MockTransport::new()
                .on_call(move |_, _| {
                    if let Some(actions) = hook_slot.get() {
                        seen.lock().unwrap().push(actions.is_submitting());
                    }
                })
                .reply_json(Method::Delete, "/api/v1/blocks/1", json!({})),
        );
        let actions = Arc::new(actions(&cache, transport));
        assert!(slot.set(Arc::clone(&actions)).is_ok());

        actions.delete_entity("1", EntityCallbacks::new()).await.unwrap();
        assert_eq!(*observed.lock().unwrap(), vec![true]);
        assert!(!actions.is_submitting());
    }

    #[test]
    fn test_change_entity_handle() {
        let cache = EntityCache::new();
        seed(&cache);
        let change = ChangeEntity::<Account>::new(Arc::clone(&cache));

        assert!(change.change_entity("1", |mut a| {
            a.display_name = "One".to_string();
            a
        }));
        assert_eq!(cache.get_as::<Account>("1").unwrap().display_name, "One");
        assert!(!change.change_entity("404", |a| a));
    }

    #[tokio::test]
    async fn test_optimistic_transaction_reverts_on_failure() {
        let cache = EntityCache::new();
        cache.import_entities(
            vec![Entity::from_value(json!({"id": "s1", "favourites_count": 4})).unwrap()],
            EntityKind::Statuses,
            None,
        );

        let favourite = |delta: i64| {
            Transaction::new().update_as::<Status, _>("s1", move |mut s| {
                s.favourited = delta > 0;
                s.favourites_count = s.favourites_count.saturating_add_signed(delta);
                s
            })
        };

        let ok: Result<(), CacheError> =
            optimistic_transaction(&cache, favourite(1), favourite(-1), async { Ok::<_, CacheError>(()) }).await;
        assert!(ok.is_ok());
        assert_eq!(cache.get_as::<Status>("s1").unwrap().favourites_count, 5);

        let failed: Result<(), CacheError> = optimistic_transaction(&cache, favourite(1), favourite(-1), async {
            Err::<(), _>(CacheError::InvalidResponse("down".to_string()))
        })
        .await;
        assert!(failed.is_err());
        let s1 = cache.get_as::<Status>("s1").unwrap();
        assert_eq!(s1.favourites_count, 5);
        assert!(!s1.favourited);
    }
}
