//! Entity kind tags and list keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of server object held by the cache.
///
/// Adding a kind means adding a variant here and, if callers want typed
/// reads, a shape implementing [`EntityShape`](crate::EntityShape).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Accounts,
    Announcements,
    Domains,
    GroupMemberships,
    GroupRelationships,
    Groups,
    Notifications,
    Relationships,
    Rules,
    Statuses,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Accounts,
        EntityKind::Announcements,
        EntityKind::Domains,
        EntityKind::GroupMemberships,
        EntityKind::GroupRelationships,
        EntityKind::Groups,
        EntityKind::Notifications,
        EntityKind::Relationships,
        EntityKind::Rules,
        EntityKind::Statuses,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Accounts => "Accounts",
            EntityKind::Announcements => "Announcements",
            EntityKind::Domains => "Domains",
            EntityKind::GroupMemberships => "GroupMemberships",
            EntityKind::GroupRelationships => "GroupRelationships",
            EntityKind::Groups => "Groups",
            EntityKind::Notifications => "Notifications",
            EntityKind::Relationships => "Relationships",
            EntityKind::Rules => "Rules",
            EntityKind::Statuses => "Statuses",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite key naming one ordered view over a kind, e.g. `Accounts:blocks`.
///
/// The kind is always the first component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListKey {
    kind: EntityKind,
    path: Vec<String>,
}

impl ListKey {
    pub fn new<I, S>(kind: EntityKind, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for part in &self.path {
            write!(f, ":{}", part)?;
        }
        Ok(())
    }
}
