//! Notifications: normalization, duplicate grouping, and the paginated feed.
//!
//! Every notification is stored. Ones that repeat an earlier event, such as
//! a favourite and an emoji reaction by the same account on the same status,
//! are marked `duplicate` and left out of the visible feed and unread count.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::store::{ListImport, ListPlacement};
use crate::{
    CacheError, CacheUpdate, Entity, EntityCache, EntityId, EntityKind, ListKey, Transaction, Transport, compare_ids,
    entity_shape,
};

/// Notification types, as named by Mastodon and Pleroma.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationType {
    Mention,
    Status,
    Reblog,
    Follow,
    FollowRequest,
    Favourite,
    Poll,
    Update,
    AdminSignUp,
    AdminReport,
    EmojiReaction,
    ChatMention,
    Move,
    Other(String),
}

impl NotificationType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Mention => "mention",
            Self::Status => "status",
            Self::Reblog => "reblog",
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
            Self::Favourite => "favourite",
            Self::Poll => "poll",
            Self::Update => "update",
            Self::AdminSignUp => "admin.sign_up",
            Self::AdminReport => "admin.report",
            Self::EmojiReaction => "pleroma:emoji_reaction",
            Self::ChatMention => "pleroma:chat_mention",
            Self::Move => "move",
            Self::Other(other) => other,
        }
    }

    /// Types in the same class describe the same kind of event.
    pub fn class(&self) -> &str {
        match self {
            Self::Favourite | Self::EmojiReaction => "reaction",
            Self::Follow | Self::FollowRequest => "follow",
            other => other.as_str(),
        }
    }
}

impl From<String> for NotificationType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "mention" => Self::Mention,
            "status" => Self::Status,
            "reblog" => Self::Reblog,
            "follow" => Self::Follow,
            "follow_request" => Self::FollowRequest,
            "favourite" => Self::Favourite,
            "poll" => Self::Poll,
            "update" => Self::Update,
            "admin.sign_up" => Self::AdminSignUp,
            "admin.report" => Self::AdminReport,
            "pleroma:emoji_reaction" => Self::EmojiReaction,
            "pleroma:chat_mention" => Self::ChatMention,
            "move" => Self::Move,
            _ => Self::Other(value),
        }
    }
}

impl From<NotificationType> for String {
    fn from(value: NotificationType) -> Self {
        match value {
            NotificationType::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored notification. The account and status it refers to are stored
/// under their own kinds and referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub created_at: DateTime<Utc>,
    /// The account that triggered the notification.
    pub account_id: String,
    /// The status, moved-to account, or report the notification is about.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Repeats an earlier notification; kept for lookups, hidden from the feed.
    #[serde(default)]
    pub duplicate: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

entity_shape! {
    Notification => Notifications;
}

/// A notification with its embedded entities split out.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedNotification {
    pub notification: Notification,
    pub accounts: Vec<Entity>,
    pub statuses: Vec<Entity>,
}

fn take_entity(fields: &mut Map<String, Value>, key: &str) -> Result<Option<Entity>, CacheError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Entity::from_value(value).map(Some),
    }
}

/// Split a notification as the server sends it into the notification and
/// the accounts and statuses it embeds.
pub fn normalize_notification(raw: Value) -> Result<NormalizedNotification, CacheError> {
    let Value::Object(mut fields) = raw else {
        return Err(CacheError::InvalidEntity("notification is not an object".to_string()));
    };

    let mut accounts = Vec::new();
    let mut statuses = Vec::new();
    let mut target_id = None;

    if let Some(account) = take_entity(&mut fields, "account")? {
        fields.insert("account_id".to_string(), Value::String(account.id().to_string()));
        accounts.push(account);
    }

    if let Some(status) = take_entity(&mut fields, "status")? {
        // The author is stored too; the status body stays as sent.
        if let Some(author) = status.value().get("account").cloned() {
            match Entity::from_value(author) {
                Ok(author) => accounts.push(author),
                Err(e) => debug!(status = %status.id(), error = %e, "status author not stored"),
            }
        }
        target_id = Some(status.id().to_string());
        statuses.push(status);
    }

    if let Some(target) = take_entity(&mut fields, "target")? {
        target_id = Some(target.id().to_string());
        accounts.push(target);
    }

    if target_id.is_none() {
        target_id = fields
            .get("report")
            .and_then(|report| report.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    if let Some(target_id) = target_id {
        fields.insert("target_id".to_string(), Value::String(target_id));
    }

    let notification: Notification = serde_json::from_value(Value::Object(fields))
        .map_err(|e| CacheError::schema(EntityKind::Notifications, e))?;

    Ok(NormalizedNotification {
        notification,
        accounts,
        statuses,
    })
}

/// Notifications sharing a key describe the same event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub class: String,
    pub account_id: String,
    pub target_id: Option<String>,
}

impl GroupKey {
    pub fn of(notification: &Notification) -> Self {
        Self {
            class: notification.kind.class().to_string(),
            account_id: notification.account_id.clone(),
            target_id: notification.target_id.clone(),
        }
    }
}

/// Earliest first; equal timestamps go to the smaller id.
fn earliest_first(a: (&DateTime<Utc>, &str), b: (&DateTime<Utc>, &str)) -> CmpOrdering {
    a.0.cmp(b.0).then_with(|| compare_ids(a.1, b.1))
}

#[derive(Debug, Clone)]
struct Canonical {
    created_at: DateTime<Utc>,
    id: EntityId,
}

/// Tracks the canonical notification of every group seen this session.
#[derive(Debug, Default)]
pub struct NotificationDeduplicator {
    seen: DashMap<GroupKey, Canonical>,
}

impl NotificationDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `duplicate` on every notification of `page`.
    ///
    /// Returns the ids of notifications from earlier pages that were
    /// canonical and no longer are.
    pub fn deduplicate(&self, page: &mut [Notification]) -> Vec<EntityId> {
        let mut order: Vec<usize> = (0..page.len()).collect();
        order.sort_by(|&a, &b| {
            earliest_first(
                (&page[a].created_at, &page[a].id),
                (&page[b].created_at, &page[b].id),
            )
        });

        let mut demoted = Vec::new();
        for i in order {
            let candidate = Canonical {
                created_at: page[i].created_at,
                id: page[i].id.clone(),
            };

            let duplicate = match self.seen.entry(GroupKey::of(&page[i])) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                    false
                }
                Entry::Occupied(mut slot) => {
                    let current = slot.get();
                    if current.id == candidate.id {
                        false
                    } else if earliest_first(
                        (&candidate.created_at, &candidate.id),
                        (&current.created_at, &current.id),
                    ) == CmpOrdering::Less
                    {
                        let previous = slot.insert(candidate);
                        match page.iter_mut().find(|n| n.id == previous.id) {
                            Some(n) => n.duplicate = true,
                            None => demoted.push(previous.id),
                        }
                        false
                    } else {
                        true
                    }
                }
            };
            page[i].duplicate = duplicate;
        }

        demoted
    }

    /// Normalize, deduplicate, and import a fetched page into `key`.
    ///
    /// Invalid notifications are dropped. Returns the imported notifications
    /// in page order.
    pub fn import_page(
        &self,
        cache: &EntityCache,
        page: Vec<Value>,
        key: &ListKey,
        import: ListImport,
    ) -> Vec<Notification> {
        let mut accounts = Vec::new();
        let mut statuses = Vec::new();
        let mut notifications = Vec::with_capacity(page.len());

        for raw in page {
            match normalize_notification(raw) {
                Ok(normalized) => {
                    accounts.extend(normalized.accounts);
                    statuses.extend(normalized.statuses);
                    notifications.push(normalized.notification);
                }
                Err(e) => warn!(error = %e, "dropping notification that failed validation"),
            }
        }

        let demoted = self.deduplicate(&mut notifications);
        if !demoted.is_empty() {
            debug!(count = demoted.len(), "earlier notifications demoted to duplicates");
        }
        let tx = demoted.into_iter().fold(Transaction::new(), |tx, id| {
            tx.update_value(EntityKind::Notifications, id, |v| v["duplicate"] = Value::Bool(true))
        });

        let entities: Vec<Entity> = notifications
            .iter()
            .filter_map(|n| {
                Entity::from_shape(n)
                    .inspect_err(|e| warn!(id = %n.id, error = %e, "notification not storable"))
                    .ok()
            })
            .collect();

        let events = [
            (EntityKind::Accounts, ids_of(&accounts), None),
            (EntityKind::Statuses, ids_of(&statuses), None),
            (key.kind(), ids_of(&entities), Some(key.clone())),
        ];

        // Demotions and the new page land in one update.
        let changed = cache.modify(|store| {
            store.import_entities(accounts, EntityKind::Accounts, None);
            store.import_entities(statuses, EntityKind::Statuses, None);
            let changed = store.apply_transaction(tx);
            store.import_into_list(entities, key.kind(), key, import);
            changed
        });

        if !changed.is_empty() {
            cache.broadcast(CacheUpdate::TransactionApplied { changed });
        }
        for (kind, ids, list) in events {
            if !ids.is_empty() || list.is_some() {
                cache.broadcast(CacheUpdate::Imported { kind, ids, list });
            }
        }

        notifications
    }

    /// Forget every group, e.g. after the signed-in account changes.
    pub fn clear(&self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn ids_of(entities: &[Entity]) -> Vec<EntityId> {
    entities.iter().map(|e| e.id().to_string()).collect()
}

/// Canonical notifications of a list, in list order.
pub fn visible_notifications(cache: &EntityCache, key: &ListKey) -> Vec<Notification> {
    cache
        .list_entities::<Notification>(key)
        .into_iter()
        .filter(|n| !n.duplicate)
        .collect()
}

/// Canonical notifications newer than `last_read_id`.
pub fn unread_count(cache: &EntityCache, key: &ListKey, last_read_id: Option<&str>) -> usize {
    visible_notifications(cache, key)
        .iter()
        .filter(|n| last_read_id.is_none_or(|last| compare_ids(&n.id, last) == CmpOrdering::Greater))
        .count()
}

/// Paginated notification feed.
///
/// Like [`EntitiesQuery`](crate::EntitiesQuery), but every page goes through
/// the session's [`NotificationDeduplicator`]. Refreshing a fetched feed
/// prepends newer notifications and keeps the cursor.
pub struct NotificationFeed {
    cache: Arc<EntityCache>,
    transport: Arc<dyn Transport>,
    dedup: Arc<NotificationDeduplicator>,
    list_key: ListKey,
    endpoint: String,
    fetching: AtomicBool,
    error: AtomicBool,
}

impl NotificationFeed {
    pub fn new(
        cache: Arc<EntityCache>,
        transport: Arc<dyn Transport>,
        dedup: Arc<NotificationDeduplicator>,
        list_key: ListKey,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            transport,
            dedup,
            list_key,
            endpoint: endpoint.into(),
            fetching: AtomicBool::new(false),
            error: AtomicBool::new(false),
        }
    }

    pub fn list_key(&self) -> &ListKey {
        &self.list_key
    }

    pub fn notifications(&self) -> Vec<Notification> {
        visible_notifications(&self.cache, &self.list_key)
    }

    pub fn unread_count(&self, last_read_id: Option<&str>) -> usize {
        unread_count(&self.cache, &self.list_key, last_read_id)
    }

    pub fn has_next_page(&self) -> bool {
        self.cache
            .read(|store| store.list(&self.list_key).is_some_and(|l| l.next.is_some()))
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    /// Fetching with nothing fetched yet.
    pub fn is_loading(&self) -> bool {
        self.is_fetching()
            && !self
                .cache
                .read(|store| store.list(&self.list_key).is_some_and(|l| l.fetched))
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Fetch the newest page.
    pub async fn fetch_notifications(&self) -> Result<Vec<Notification>, CacheError> {
        let fetched = self
            .cache
            .read(|store| store.list(&self.list_key).is_some_and(|l| l.fetched));
        let import = if fetched {
            ListImport {
                placement: ListPlacement::Start,
                settles_fetch: true,
                ..Default::default()
            }
        } else {
            ListImport::page(ListPlacement::Replace, None)
        };
        self.fetch_page(&self.endpoint, import).await
    }

    /// Fetch the page after the last one. `None` when there is none or a
    /// request for this feed is already in flight.
    pub async fn fetch_next_page(&self) -> Result<Option<Vec<Notification>>, CacheError> {
        let next = self
            .cache
            .read(|store| store.list(&self.list_key).and_then(|l| l.next.clone()));
        let Some(next) = next else {
            return Ok(None);
        };
        if self.is_fetching() {
            debug!(list = %self.list_key, "next page requested while fetching, ignored");
            return Ok(None);
        }
        self.fetch_page(&next, ListImport::page(ListPlacement::End, None))
            .await
            .map(Some)
    }

    async fn fetch_page(&self, endpoint: &str, mut import: ListImport) -> Result<Vec<Notification>, CacheError> {
        self.fetching.store(true, Ordering::SeqCst);
        self.cache.set_list_loading(&self.list_key, true);

        let result = async { self.transport.get(endpoint).await?.into_page() }.await;

        self.fetching.store(false, Ordering::SeqCst);
        self.error.store(result.is_err(), Ordering::SeqCst);

        match result {
            Ok((page, next)) => {
                if import.update_next {
                    import.next = next;
                }
                Ok(self.dedup.import_page(&self.cache, page, &self.list_key, import))
            }
            Err(e) => {
                debug!(list = %self.list_key, error = %e, "notification page fetch failed");
                self.cache.set_list_error(&self.list_key, Some(e.to_string()));
                Err(e)
            }
        }
    }
}
