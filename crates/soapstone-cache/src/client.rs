//! Mastodon-compatible REST client implementing [`Transport`].

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{CacheError, Transport, TransportResponse};

/// Matches the `rel="next"` target of a `Link` header.
static NEXT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap());

/// Client for one instance's REST API.
pub struct HttpClient {
    http: Client,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl HttpClient {
    /// Create a new client for the given instance URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Use `token` as the bearer token for every request.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token.into()))),
            ..self
        }
    }

    /// Replace the bearer token (e.g. after switching accounts).
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Get the instance URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an endpoint path. Absolute URLs (pagination links) pass through.
    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.read().await.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Result<TransportResponse, CacheError> {
        let response = self.authorize(request).await.send().await?;
        let result = handle_response(response, endpoint).await;
        match &result {
            Ok(r) => debug!(endpoint = %endpoint, has_next = r.next.is_some(), "request succeeded"),
            Err(e) => debug!(endpoint = %endpoint, error = %e, "request failed"),
        }
        result
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn get(&self, endpoint: &str) -> Result<TransportResponse, CacheError> {
        let request = self.http.get(self.url(endpoint));
        self.send(request, endpoint).await
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<TransportResponse, CacheError> {
        let request = self.http.post(self.url(endpoint)).json(body);
        self.send(request, endpoint).await
    }

    async fn delete(&self, endpoint: &str) -> Result<TransportResponse, CacheError> {
        let request = self.http.delete(self.url(endpoint));
        self.send(request, endpoint).await
    }
}

/// Error body format shared by Mastodon and its forks.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Extract the next-page URL from a `Link` header value.
pub fn parse_next_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find_map(|part| NEXT_LINK_RE.captures(part))
        .map(|caps| caps[1].to_string())
}

/// Map status codes to errors and parse the JSON body.
async fn handle_response(response: Response, endpoint: &str) -> Result<TransportResponse, CacheError> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(CacheError::NotFound {
            endpoint: endpoint.to_string(),
        });
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(CacheError::RateLimited {
            endpoint: Some(endpoint.to_string()),
            retry_after_secs,
        });
    }

    if !status.is_success() {
        let text = response.text().await.map_err(|e| {
            CacheError::InvalidResponse(format!(
                "request failed ({}): failed to read response: {}",
                status, e
            ))
        })?;

        if let Ok(api_error) = serde_json::from_str::<ApiError>(&text) {
            return Err(CacheError::Api {
                status: status.as_u16(),
                error: api_error.error,
                description: api_error.error_description,
            });
        }

        return Err(CacheError::InvalidResponse(format!(
            "request failed ({}): {}",
            status, text
        )));
    }

    let next = response
        .headers()
        .get(reqwest::header::LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_next_link);

    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };

    Ok(TransportResponse { body, next })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_client_base_url() {
        let client = HttpClient::new("https://example.com/");
        assert_eq!(client.base_url(), "https://example.com");
        assert_eq!(client.url("/api/v1/blocks"), "https://example.com/api/v1/blocks");
        assert_eq!(
            client.url("https://other.example/api/v1/blocks?max_id=1"),
            "https://other.example/api/v1/blocks?max_id=1"
        );
    }

    #[test]
    fn test_parse_next_link() {
        let header = r#"<https://example.com/api/v1/blocks?max_id=9>; rel="next", <https://example.com/api/v1/blocks?since_id=20>; rel="prev""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://example.com/api/v1/blocks?max_id=9")
        );

        let prev_only = r#"<https://example.com/api/v1/blocks?since_id=20>; rel="prev""#;
        assert_eq!(parse_next_link(prev_only), None);
    }

    #[tokio::test]
    async fn test_get_with_token_and_link() {
        let mock_server = MockServer::start().await;
        let next = format!("{}/api/v1/blocks?max_id=2", mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/api/v1/blocks"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", format!("<{}>; rel=\"next\"", next).as_str())
                    .set_body_json(json!([{"id": "1", "acct": "alice"}])),
            )
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri()).with_token("secret");
        let response = client.get("/api/v1/blocks").await.unwrap();

        assert_eq!(response.body, json!([{"id": "1", "acct": "alice"}]));
        assert_eq!(response.next, Some(next));
    }

    #[tokio::test]
    async fn test_post_sends_json() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/lists"))
            .and(body_json(json!({"title": "friends"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "7", "title": "friends"})))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri());
        let response = client
            .post("/api/v1/lists", &json!({"title": "friends"}))
            .await
            .unwrap();
        assert_eq!(response.body["id"], "7");
    }

    #[tokio::test]
    async fn test_delete_empty_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v1/lists/7"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri());
        let response = client.delete("/api/v1/lists/7").await.unwrap();
        assert_eq!(response.body, Value::Null);
    }

    #[tokio::test]
    async fn test_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri());
        let result = client.get("/api/v1/accounts/404").await;
        assert!(matches!(result.unwrap_err(), CacheError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/notifications"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri());
        let result = client.get("/api/v1/notifications").await;

        match result.unwrap_err() {
            CacheError::RateLimited {
                endpoint,
                retry_after_secs,
            } => {
                assert_eq!(endpoint.as_deref(), Some("/api/v1/notifications"));
                assert_eq!(retry_after_secs, Some(30));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_error_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/v1/statuses/1"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "error": "Validation failed",
                "error_description": "cannot delete"
            })))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new(mock_server.uri());
        let err = client.delete("/api/v1/statuses/1").await.unwrap_err();

        assert!(matches!(err, CacheError::Api { status: 422, .. }));
        assert_eq!(err.to_string(), "API error (422): Validation failed - cannot delete");
    }
}
