//! Outbound HTTP seam for gateway adapters.
//!
//! Adapters build a [`GatewayRequest`] and hand it to a [`GatewayTransport`].
//! Production uses [`ReqwestTransport`]; tests swap in a scripted transport.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// HTTP method used by gateway calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A fully-built outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl GatewayRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body.into()),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw gateway response. Non-2xx statuses are returned here, not as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure. Every variant means "no usable answer".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Sends requests to a payment gateway.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, TransportError>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport whose client enforces `timeout` on every request.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GatewayTransport for ReqwestTransport {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, TransportError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(GatewayResponse { status, body })
    }
}

/// Scripted transport for tests.
#[cfg(any(test, feature = "test-payments"))]
pub mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Inner {
        responses: Mutex<VecDeque<Result<GatewayResponse, TransportError>>>,
        requests: Mutex<Vec<GatewayRequest>>,
    }

    /// Replays queued responses in order and records every request.
    ///
    /// Cloning shares the queue, so a test can keep a handle after giving
    /// one to an adapter. An empty queue answers with a connection error.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        inner: Arc<Inner>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response.
        pub fn respond_with(&self, status: u16, body: impl Into<String>) -> &Self {
            self.inner
                .responses
                .lock()
                .unwrap()
                .push_back(Ok(GatewayResponse::new(status, body)));
            self
        }

        /// Queue a transport failure.
        pub fn fail_with(&self, error: TransportError) -> &Self {
            self.inner.responses.lock().unwrap().push_back(Err(error));
            self
        }

        /// Every request sent so far.
        pub fn requests(&self) -> Vec<GatewayRequest> {
            self.inner.requests.lock().unwrap().clone()
        }

        pub fn request_count(&self) -> usize {
            self.inner.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GatewayTransport for MockTransport {
        async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, TransportError> {
            self.inner.requests.lock().unwrap().push(request);
            self.inner
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("no scripted response".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockTransport;
    use super::*;

    #[test]
    fn request_builders() {
        let req = GatewayRequest::post_json("https://gw.test/pay", "{}").header("X-VERIFY", "abc###1");
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.header_value("x-verify"), Some("abc###1"));
        assert_eq!(req.header_value("content-type"), Some("application/json"));

        let req = GatewayRequest::get("https://gw.test/status");
        assert!(req.body.is_none());
        assert!(req.headers.is_empty());
    }

    #[test]
    fn response_success_range() {
        assert!(GatewayResponse::new(200, "").is_success());
        assert!(GatewayResponse::new(204, "").is_success());
        assert!(!GatewayResponse::new(302, "").is_success());
        assert!(!GatewayResponse::new(500, "").is_success());
    }

    #[test]
    fn transport_error_messages() {
        assert_eq!(TransportError::Timeout.to_string(), "request timed out");
        assert_eq!(
            TransportError::Connect("refused".to_string()).to_string(),
            "connection failed: refused"
        );
    }

    #[tokio::test]
    async fn mock_replays_in_order() {
        let mock = MockTransport::new();
        mock.respond_with(200, "first").fail_with(TransportError::Timeout);

        let first = mock.send(GatewayRequest::get("https://a")).await.unwrap();
        assert_eq!(first.body, "first");
        assert_eq!(
            mock.send(GatewayRequest::get("https://b")).await,
            Err(TransportError::Timeout)
        );
        assert!(matches!(
            mock.send(GatewayRequest::get("https://c")).await,
            Err(TransportError::Connect(_))
        ));
        assert_eq!(mock.request_count(), 3);
        assert_eq!(mock.requests()[1].url, "https://b");
    }
}
