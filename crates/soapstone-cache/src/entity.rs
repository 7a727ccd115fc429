//! Stored entities and their typed shapes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;

use crate::{CacheError, EntityKind};

/// Opaque id, unique within an [`EntityKind`].
pub type EntityId = String;

/// A server object as stored in the cache.
///
/// The JSON body is kept verbatim; only `id` is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    value: Value,
}

impl Entity {
    /// Wrap a JSON object carrying a string `id`.
    pub fn from_value(value: Value) -> Result<Self, CacheError> {
        let id = match value.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => {
                return Err(CacheError::InvalidEntity(format!(
                    "id must be a string, got {}",
                    other
                )));
            }
            None => {
                return Err(CacheError::InvalidEntity(
                    "object has no id field".to_string(),
                ));
            }
        };
        Ok(Self { id, value })
    }

    /// Serialize a typed shape into a storable entity.
    pub fn from_shape<T: EntityShape>(shape: &T) -> Result<Self, CacheError> {
        Self::from_value(serde_json::to_value(shape)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Read the stored body through a typed shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// Typed view over the entities of one kind.
///
/// Deserializing into the shape is the schema check: a stored body that
/// fails to parse is treated as absent by the accessors.
pub trait EntityShape: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

/// Implement [`EntityShape`] for a struct with an `id: String` field.
#[macro_export]
macro_rules! entity_shape {
    ($($shape:ty => $kind:ident;)+) => {
        $(
            impl $crate::EntityShape for $shape {
                const KIND: $crate::EntityKind = $crate::EntityKind::$kind;

                fn id(&self) -> &str {
                    &self.id
                }
            }
        )+
    };
}

/// Keep the values of a fetched batch that parse as `T`, dropping the rest.
pub(crate) fn validate_all<T: EntityShape>(values: Vec<Value>) -> Vec<Entity> {
    let total = values.len();
    let entities: Vec<Entity> = values
        .into_iter()
        .filter_map(|value| {
            if let Err(e) = T::deserialize(&value) {
                warn!(kind = %T::KIND, error = %e, "dropping entity that failed validation");
                return None;
            }
            Entity::from_value(value)
                .inspect_err(|e| warn!(kind = %T::KIND, error = %e, "dropping entity without id"))
                .ok()
        })
        .collect();

    if entities.len() < total {
        warn!(kind = %T::KIND, dropped = total - entities.len(), total, "batch had invalid entities");
    }
    entities
}

/// Order two ids the way the server allocates them.
///
/// Numeric ids (snowflakes) compare by value; anything else compares
/// lexicographically.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}
