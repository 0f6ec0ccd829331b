//! Scripted in-memory transport for tests
//!
//! Replies are registered per URL path (the part after the host, e.g.
//! `/restmachine/cloudapi/machines/get`). Queued replies are consumed in order and the last
//! one stays in place for any further calls. Every request is recorded.

use crate::transport::{HttpReply, HttpRequest, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

/// What the mock answers with
#[derive(Debug, Clone)]
pub enum MockReply {
    /// An answered request with the given status and body
    Reply(u16, String),
    /// The request times out
    Timeout,
    /// The connection is refused or reset
    ConnectionReset,
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        MockReply::Reply(200, body.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        MockReply::Reply(200, value.to_string())
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        MockReply::Reply(status, body.into())
    }
}

enum Route {
    Queue(VecDeque<MockReply>),
    Handler(Handler),
}

/// A [`Transport`] that never touches the network
#[derive(Clone, Default)]
pub struct MockTransport {
    routes: Arc<Mutex<HashMap<String, Route>>>,
    calls: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for a path
    pub fn on(&self, path: &str, reply: MockReply) -> &Self {
        let mut routes = lock(&self.routes);
        match routes.get_mut(path) {
            Some(Route::Queue(queue)) => queue.push_back(reply),
            _ => {
                routes.insert(path.to_string(), Route::Queue(VecDeque::from([reply])));
            }
        }
        self
    }

    /// Answer a path through a closure, replacing anything queued for it
    pub fn on_fn<F>(&self, path: &str, handler: F) -> &Self
    where
        F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
    {
        lock(&self.routes).insert(path.to_string(), Route::Handler(Arc::new(handler)));
        self
    }

    /// Recorded requests whose URL ends with `path`
    pub fn calls_to(&self, path: &str) -> Vec<HttpRequest> {
        lock(&self.calls)
            .iter()
            .filter(|r| r.url.ends_with(path))
            .cloned()
            .collect()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    fn reply_for(&self, request: &HttpRequest) -> MockReply {
        let mut routes = lock(&self.routes);
        let route = routes
            .iter_mut()
            .filter(|(path, _)| request.url.ends_with(path.as_str()))
            .max_by_key(|(path, _)| path.len())
            .map(|(_, route)| route);

        match route {
            Some(Route::Queue(queue)) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| MockReply::status(500, "empty mock queue")),
            Some(Route::Queue(queue)) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| MockReply::status(500, "empty mock queue")),
            Some(Route::Handler(handler)) => {
                let handler = Arc::clone(handler);
                drop(routes);
                handler(request)
            }
            None => MockReply::status(404, format!("no mock route for {}", request.url)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        lock(&self.calls).push(request.clone());

        match self.reply_for(&request) {
            MockReply::Reply(status, body) => Ok(HttpReply { status, body }),
            MockReply::Timeout => Err(TransportError::Timeout),
            MockReply::ConnectionReset => {
                Err(TransportError::Connect("connection reset by peer".to_string()))
            }
        }
    }
}
