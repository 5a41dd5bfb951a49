//! Scripted transport for testing.
//!
//! Answers every request from an in-process handler closure instead of the
//! network, optionally after a per-route delay, and records each call so
//! tests can assert on what was sent. Created via [`ScriptedTransport::new`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ApiRequest, ApiResponse, HttpTransport, Method, TransportError};

/// Handler invoked for every request: receives the request and the bearer
/// token it was sent with.
type Handler = dyn Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError> + Send + Sync;

/// One request as seen by a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Bearer token attached to the request.
    pub bearer: Option<String>,
    /// JSON body.
    pub body: Option<serde_json::Value>,
}

/// Shared log of the calls a [`ScriptedTransport`] received.
///
/// Stays readable after the transport has been moved into a gateway.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<RecordedCall>>>);

impl CallLog {
    /// Every call so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.0.lock().clone()
    }

    /// How many calls matched `method` and `path` exactly.
    #[must_use]
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }

    fn push(&self, call: RecordedCall) {
        self.0.lock().push(call);
    }
}

/// In-process transport answering from a handler closure.
pub struct ScriptedTransport {
    handler: Arc<Handler>,
    latency: Vec<(Method, String, Duration)>,
    log: CallLog,
}

impl ScriptedTransport {
    /// Create a transport that answers every request with `handler`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use taskman::transport::scripted::ScriptedTransport;
    /// use taskman::transport::{ApiRequest, ApiResponse, HttpTransport};
    ///
    /// # async fn example() {
    /// let transport = ScriptedTransport::new(|_req, bearer| {
    ///     Ok(ApiResponse::empty(if bearer.is_some() { 200 } else { 401 }))
    /// });
    /// let resp = transport.send(&ApiRequest::get("/tasks/"), Some("t")).await.unwrap();
    /// assert_eq!(resp.status, 200);
    /// # }
    /// ```
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            latency: Vec::new(),
            log: CallLog::default(),
        }
    }

    /// Delay responses to `method` requests whose path starts with
    /// `path_prefix`. The handler runs after the delay.
    #[must_use]
    pub fn with_latency(mut self, method: Method, path_prefix: &str, delay: Duration) -> Self {
        self.latency.push((method, path_prefix.to_string(), delay));
        self
    }

    /// Handle on the call log.
    #[must_use]
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn delay_for(&self, request: &ApiRequest) -> Option<Duration> {
        self.latency
            .iter()
            .find(|(method, prefix, _)| *method == request.method && request.path.starts_with(prefix))
            .map(|(_, _, delay)| *delay)
    }
}

impl HttpTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.log.push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            body: request.body.clone(),
        });

        if let Some(delay) = self.delay_for(request) {
            tokio::time::sleep(delay).await;
        }

        (self.handler)(request, bearer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_from_handler_and_records_calls() {
        let transport = ScriptedTransport::new(|req, _| {
            Ok(ApiResponse::json(200, &serde_json::json!({"path": req.path})))
        });
        let log = transport.call_log();

        let resp = transport
            .send(&ApiRequest::get("/tasks/"), Some("tok"))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let calls = log.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer.as_deref(), Some("tok"));
        assert_eq!(log.count(Method::Get, "/tasks/"), 1);
        assert_eq!(log.count(Method::Post, "/tasks/"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_applies_to_matching_routes_only() {
        let transport = ScriptedTransport::new(|_, _| Ok(ApiResponse::empty(204)))
            .with_latency(Method::Patch, "/tasks/", Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        transport.send(&ApiRequest::get("/tasks/"), None).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        let patch = ApiRequest::patch("/tasks/1/", &serde_json::json!({})).unwrap();
        transport.send(&patch, None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let transport =
            ScriptedTransport::new(|_, _| Err(TransportError::Connect("refused".to_string())));
        let result = transport.send(&ApiRequest::get("/tasks/"), None).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
