//! Mock transport for testing.
//!
//! Scripted responses are served in FIFO order; routes answer every request
//! whose URL starts with a prefix, which suits concurrent asset downloads
//! where arrival order is not fixed.

use super::{HttpRequest, HttpResponse, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Mock transport for testing.
///
/// Allows queueing responses and capturing sent requests for verification.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    sent_requests: Vec<HttpRequest>,
    response_queue: VecDeque<HttpResponse>,
    routes: Vec<(String, HttpResponse)>,
    fail_next_request: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a response for the next unrouted request.
    pub fn queue_response(&self, response: HttpResponse) {
        self.inner().response_queue.push_back(response);
    }

    /// Queue a 200 response with a JSON body.
    pub fn queue_json(&self, body: serde_json::Value) {
        self.queue_response(HttpResponse::json(&body));
    }

    /// Answer every request whose URL starts with `prefix`.
    ///
    /// Routes are checked in insertion order, before the FIFO queue. Setting
    /// the same prefix again replaces its response.
    pub fn route(&self, prefix: &str, response: HttpResponse) {
        let mut inner = self.inner();
        match inner.routes.iter_mut().find(|(p, _)| p == prefix) {
            Some(route) => route.1 = response,
            None => inner.routes.push((prefix.to_string(), response)),
        }
    }

    /// Get all requests that were sent.
    pub fn sent_requests(&self) -> Vec<HttpRequest> {
        self.inner().sent_requests.clone()
    }

    /// Get the last request that was sent.
    pub fn last_sent(&self) -> Option<HttpRequest> {
        self.inner().sent_requests.last().cloned()
    }

    /// Number of requests whose URL starts with `prefix`.
    pub fn count_requests(&self, prefix: &str) -> usize {
        self.inner()
            .sent_requests
            .iter()
            .filter(|r| r.url.starts_with(prefix))
            .count()
    }

    /// Responses still queued.
    pub fn queued(&self) -> usize {
        self.inner().response_queue.len()
    }

    /// Cause the next request to fail with a connection error.
    pub fn fail_next_request(&self, error: &str) {
        self.inner().fail_next_request = Some(error.to_string());
    }

    /// Clear all state (requests, queue, routes).
    pub fn reset(&self) {
        *self.inner() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut inner = self.inner();
        let url = request.url.clone();
        inner.sent_requests.push(request);

        // Check for forced failure
        if let Some(error) = inner.fail_next_request.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        let routed = inner
            .routes
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()));
        if let Some((_, response)) = routed {
            return Ok(response.clone());
        }

        inner
            .response_queue
            .pop_front()
            .ok_or_else(|| {
                TransportError::ConnectionFailed(format!("no scripted response for {}", url))
            })
    }
}
