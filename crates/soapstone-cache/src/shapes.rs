//! Typed shapes for the entity kinds the client reads.
//!
//! Each shape names the fields callers look at and keeps everything else in
//! `extra`, so a read-modify-write through a shape never drops fields the
//! server sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity_shape;

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub acct: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub followers_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub favourited: bool,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub favourites_count: u64,
    #[serde(default)]
    pub reblogged: bool,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub reblogs_count: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The viewer's relationship to another account. `id` is the other account's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub followed_by: bool,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub muting: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub members_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The viewer's membership state in a group. `id` is the group's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRelationship {
    pub id: String,
    #[serde(default)]
    pub member: bool,
    #[serde(default)]
    pub requested: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An instance or group rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An instance announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub read: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

entity_shape! {
    Account => Accounts;
    Status => Statuses;
    Relationship => Relationships;
    Group => Groups;
    GroupRelationship => GroupRelationships;
    Rule => Rules;
    Announcement => Announcements;
}

/// Deserialize a counter that some backends send as null or as a string.
fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct CountVisitor;

    impl<'de> Visitor<'de> for CountVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a non-negative integer, a numeric string, or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(0)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(0)
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            // Some servers report -1 for hidden counts.
            Ok(value.max(0) as u64)
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value.parse().map_err(de::Error::custom)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            deserializer.deserialize_any(CountVisitor)
        }
    }

    deserializer.deserialize_option(CountVisitor)
}
