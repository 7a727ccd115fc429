//! Scripted transport for accessor tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{CacheError, Transport, TransportResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Get,
    Post,
    Delete,
}

enum Reply {
    Ok(TransportResponse),
    Fail(u16, String),
}

type Hook = Box<dyn Fn(Method, &str) + Send + Sync>;

/// Replies from a per-endpoint queue; unscripted endpoints answer 404.
#[derive(Default)]
pub(crate) struct MockTransport {
    replies: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
    on_call: Option<Hook>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `hook` when a request arrives, before it is answered.
    pub(crate) fn on_call(mut self, hook: impl Fn(Method, &str) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub(crate) fn reply(self, method: Method, endpoint: &str, response: TransportResponse) -> Self {
        self.push(method, endpoint, Reply::Ok(response));
        self
    }

    pub(crate) fn reply_json(self, method: Method, endpoint: &str, body: Value) -> Self {
        self.reply(method, endpoint, TransportResponse::new(body))
    }

    pub(crate) fn fail(self, method: Method, endpoint: &str, status: u16, error: &str) -> Self {
        self.push(method, endpoint, Reply::Fail(status, error.to_string()));
        self
    }

    fn push(&self, method: Method, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry((method, endpoint.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn calls(&self) -> Vec<(Method, String, Option<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, method: Method, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, e, _)| *m == method && e == endpoint)
            .count()
    }

    fn answer(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<TransportResponse, CacheError> {
        self.calls
            .lock()
            .unwrap()
            .push((method, endpoint.to_string(), body.cloned()));
        if let Some(hook) = &self.on_call {
            hook(method, endpoint);
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&(method, endpoint.to_string()))
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Reply::Ok(response)) => Ok(response),
            Some(Reply::Fail(status, error)) => Err(CacheError::Api {
                status,
                error,
                description: None,
            }),
            None => Err(CacheError::NotFound {
                endpoint: endpoint.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, endpoint: &str) -> Result<TransportResponse, CacheError> {
        tokio::task::yield_now().await;
        self.answer(Method::Get, endpoint, None)
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<TransportResponse, CacheError> {
        tokio::task::yield_now().await;
        self.answer(Method::Post, endpoint, Some(body))
    }

    async fn delete(&self, endpoint: &str) -> Result<TransportResponse, CacheError> {
        tokio::task::yield_now().await;
        self.answer(Method::Delete, endpoint, None)
    }
}
