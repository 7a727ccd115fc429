//! Session handle tying the cache to a transport.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::{
    BatchedQuery, CacheError, ChangeEntity, EntitiesQuery, EntityActions, EntityCache, EntityEndpoints, EntityId,
    EntityLookup, EntityQuery, EntityShape, ListKey, NotificationDeduplicator, NotificationFeed, Transaction,
    Transport, UseBatchedOpts, UseEntitiesOpts, UseEntityOpts, optimistic_transaction,
};

/// One signed-in session: the shared cache, the transport, and the
/// notification groups seen so far.
///
/// Accessors are cheap to build; build one per view.
#[derive(Clone)]
pub struct EntityContext {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    dedup: Arc<NotificationDeduplicator>,
}

impl EntityContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_cache(EntityCache::new(), transport)
    }

    pub fn with_cache(cache: Arc<EntityCache>, transport: Arc<dyn Transport>) -> Self {
        Self {
            cache,
            transport,
            dedup: Arc::new(NotificationDeduplicator::new()),
        }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn use_entity<T: EntityShape>(
        &self,
        id: impl Into<EntityId>,
        endpoint: impl Into<String>,
        opts: UseEntityOpts,
    ) -> EntityQuery<T> {
        EntityQuery::new(Arc::clone(&self.cache), Arc::clone(&self.transport), id, endpoint, opts)
    }

    pub fn use_entity_lookup<T, P>(&self, endpoint: impl Into<String>, predicate: P, opts: UseEntityOpts) -> EntityLookup<T, P>
    where
        T: EntityShape,
        P: Fn(&T) -> bool + Send + Sync,
    {
        EntityLookup::new(Arc::clone(&self.cache), Arc::clone(&self.transport), endpoint, predicate, opts)
    }

    pub fn use_entities<T: EntityShape>(
        &self,
        list_key: ListKey,
        endpoint: impl Into<String>,
        opts: UseEntitiesOpts,
    ) -> EntitiesQuery<T> {
        EntitiesQuery::new(Arc::clone(&self.cache), Arc::clone(&self.transport), list_key, endpoint, opts)
    }

    pub fn use_batched_entities<T, F, Fut, I, S>(
        &self,
        list_key: ListKey,
        ids: I,
        fetch_many: F,
        opts: UseBatchedOpts,
    ) -> BatchedQuery<T, F>
    where
        T: EntityShape,
        F: Fn(Vec<EntityId>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<Value>, CacheError>> + Send,
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        BatchedQuery::new(Arc::clone(&self.cache), list_key, ids, fetch_many, opts)
    }

    pub fn use_entity_actions<T: EntityShape>(
        &self,
        list_key: Option<ListKey>,
        endpoints: EntityEndpoints,
    ) -> EntityActions<T> {
        EntityActions::new(Arc::clone(&self.cache), Arc::clone(&self.transport), list_key, endpoints)
    }

    pub fn use_change_entity<T: EntityShape>(&self) -> ChangeEntity<T> {
        ChangeEntity::new(Arc::clone(&self.cache))
    }

    pub fn use_notifications(&self, list_key: ListKey, endpoint: impl Into<String>) -> NotificationFeed {
        NotificationFeed::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.transport),
            Arc::clone(&self.dedup),
            list_key,
            endpoint,
        )
    }

    /// See [`optimistic_transaction`].
    pub async fn optimistic_transaction<R, Fut>(
        &self,
        forward: Transaction,
        inverse: Transaction,
        request: Fut,
    ) -> Result<R, CacheError>
    where
        Fut: Future<Output = Result<R, CacheError>>,
    {
        optimistic_transaction(&self.cache, forward, inverse, request).await
    }

    /// Bind the session to `account_id`. A different account than before
    /// drops every cached entity, list, and notification group.
    pub fn switch_account(&self, account_id: &str) -> bool {
        let cleared = self.cache.switch_account(account_id);
        if cleared {
            self.dedup.clear();
            info!(account = %account_id, "switched account");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Method, MockTransport};
    use crate::{Account, EntityKind};
    use serde_json::json;

    #[tokio::test]
    async fn test_switch_account_forgets_notification_groups() {
        let transport = Arc::new(
            MockTransport::new()
                .reply_json(
                    Method::Get,
                    "/api/v1/notifications",
                    json!([{
                        "id": "1",
                        "type": "favourite",
                        "created_at": "2024-01-01T00:00:00Z",
                        "account": {"id": "a1", "acct": "alice"},
                        "status": {"id": "s1"}
                    }]),
                )
                .reply_json(Method::Get, "/api/v1/accounts/a1", json!({"id": "a1", "acct": "alice"})),
        );
        let ctx = EntityContext::new(transport);
        assert!(!ctx.switch_account("me"));

        let feed = ctx.use_notifications(ListKey::new(EntityKind::Notifications, ["all"]), "/api/v1/notifications");
        feed.fetch_notifications().await.unwrap();
        assert_eq!(ctx.dedup.len(), 1);

        assert!(ctx.switch_account("someone-else"));
        assert!(ctx.dedup.is_empty());
        assert_eq!(ctx.cache().count(EntityKind::Notifications), 0);
        assert!(ctx.cache().list(feed.list_key()).is_none());

        // Accessors keep working against the cleared cache.
        let account = ctx
            .use_entity::<Account>("a1", "/api/v1/accounts/a1", UseEntityOpts::default())
            .mount()
            .await
            .unwrap();
        assert_eq!(account.unwrap().acct, "alice");
    }

    #[tokio::test]
    async fn test_accessors_share_one_cache() {
        let transport = Arc::new(MockTransport::new().reply_json(
            Method::Get,
            "/api/v1/accounts/lookup?acct=bob",
            json!({"id": "2", "acct": "bob"}),
        ));
        let ctx = EntityContext::new(Arc::clone(&transport) as Arc<dyn Transport>);

        let lookup = ctx.use_entity_lookup::<Account, _>(
            "/api/v1/accounts/lookup?acct=bob",
            |a: &Account| a.acct == "bob",
            UseEntityOpts::default(),
        );
        lookup.mount().await.unwrap();

        let by_id = ctx.use_entity::<Account>("2", "/api/v1/accounts/2", UseEntityOpts::default());
        assert_eq!(by_id.mount().await.unwrap().unwrap().acct, "bob");
        assert_eq!(transport.calls().len(), 1);

        assert!(ctx.use_change_entity::<Account>().change_entity("2", |mut a| {
            a.display_name = "Bob".to_string();
            a
        }));
        assert_eq!(by_id.entity().unwrap().display_name, "Bob");
    }
}
