//! Error types for the entity cache.

use thiserror::Error;

use crate::EntityKind;

/// Errors that can occur while fetching or mutating cached entities.
#[derive(Debug, Error)]
pub enum CacheError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint answered 404.
    #[error("not found: {endpoint}")]
    NotFound { endpoint: String },

    /// Rate limited.
    #[error("rate limited{}", match (endpoint, retry_after_secs) {
        (Some(ep), Some(secs)) => format!(" on {} (retry after {}s)", ep, secs),
        (Some(ep), None) => format!(" on {}", ep),
        (None, Some(secs)) => format!(" (retry after {}s)", secs),
        (None, None) => String::new(),
    })]
    RateLimited {
        /// The endpoint that was rate limited (optional).
        endpoint: Option<String>,
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Error body returned by the server.
    #[error("API error ({status}): {error}{}", description.as_ref().map(|d| format!(" - {}", d)).unwrap_or_default())]
    Api {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The accessor was built without the endpoint the operation needs.
    #[error("no {0} endpoint configured")]
    MissingEndpoint(&'static str),

    /// A response did not match the shape expected for its kind.
    #[error("{kind} entity failed validation: {reason}")]
    Schema { kind: EntityKind, reason: String },

    /// A value cannot be stored because it has no string `id`.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),
}

impl CacheError {
    /// Build a schema error from a deserialization failure.
    pub(crate) fn schema(kind: EntityKind, err: serde_json::Error) -> Self {
        CacheError::Schema {
            kind,
            reason: err.to_string(),
        }
    }
}
