//! The network seam the accessors call through.

use async_trait::async_trait;
use serde_json::Value;

use crate::CacheError;

/// A parsed response: JSON body plus the pagination cursor, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub body: Value,
    /// URL of the next page (from `Link: <...>; rel="next"`).
    pub next: Option<String>,
}

impl TransportResponse {
    pub fn new(body: Value) -> Self {
        Self { body, next: None }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Split a list response into its items and cursor.
    pub fn into_page(self) -> Result<(Vec<Value>, Option<String>), CacheError> {
        match self.body {
            Value::Array(items) => Ok((items, self.next)),
            other => Err(CacheError::InvalidResponse(format!(
                "expected a JSON array, got {}",
                json_type(&other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// HTTP collaborator: `GET/POST/DELETE endpoint → JSON or error`.
///
/// Implementations do not retry; a failure is reported once.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, endpoint: &str) -> Result<TransportResponse, CacheError>;

    async fn post(&self, endpoint: &str, body: &Value) -> Result<TransportResponse, CacheError>;

    async fn delete(&self, endpoint: &str) -> Result<TransportResponse, CacheError>;
}
