//! Normalized entity cache for Soapstone.
//!
//! Every server object the client fetches is stored once, by kind and id,
//! with named ordered lists over those ids. Views read through accessors
//! that fetch on a miss and write back through a small set of transitions.
//!
//! ## Features
//!
//! - **Store**: per-kind `byId` maps and ordered lists, changed only by
//!   import, delete, and transaction transitions
//! - **Cache**: the shared store behind a `watch` channel, with typed update events
//! - **Accessors**: single entity, lookup, paginated list, and batched fetches
//! - **Mutations**: pessimistic create, optimistic delete with rollback,
//!   optimistic cross-kind transactions
//! - **Notifications**: normalization and duplicate grouping before import
//! - **HTTP**: a `reqwest` transport for Mastodon-compatible APIs

pub mod actions;
pub mod batch;
pub mod cache;
mod client;
pub mod context;
mod entity;
mod error;
pub mod fetch;
mod kind;
pub mod list;
pub mod notifications;
mod shapes;
pub mod store;
mod transaction;
mod transport;

#[cfg(test)]
mod testing;

pub use actions::{ChangeEntity, Created, EntityActions, EntityCallbacks, EntityEndpoints, optimistic_transaction};
pub use batch::{BatchedQuery, UseBatchedOpts};
pub use cache::{CacheUpdate, EntityCache};
pub use client::{HttpClient, parse_next_link};
pub use context::EntityContext;
pub use entity::{Entity, EntityId, EntityShape, compare_ids};
pub use error::CacheError;
pub use fetch::{EntityLookup, EntityQuery, UseEntityOpts};
pub use kind::{EntityKind, ListKey};
pub use list::{EntitiesQuery, UseEntitiesOpts};
pub use notifications::{
    GroupKey, NormalizedNotification, Notification, NotificationDeduplicator, NotificationFeed, NotificationType,
    normalize_notification, unread_count, visible_notifications,
};
pub use shapes::*;
pub use store::{DeleteOptions, EntityList, KindStore, ListImport, ListPlacement, Store};
pub use transaction::{Transaction, Updater};
pub use transport::{Transport, TransportResponse};
