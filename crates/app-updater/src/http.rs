//! HTTP transport boundary.
//!
//! Everything that touches the network goes through [`HttpTransport`]:
//! feed fetches and artifact streams. The client receives a transport at
//! construction, so tests and offline tooling can substitute
//! [`MemoryTransport`] for the reqwest-backed [`ReqwestTransport`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderValue, RANGE};
use thiserror::Error;
use tracing::debug;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Failure below the HTTP status layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("response body error: {0}")]
    Body(String),

    #[error("http client error: {0}")]
    Client(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Client(e.to_string())
        }
    }
}

/// A streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A GET request, optionally for a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    /// Request bytes from this offset to the end (`Range: bytes=N-`)
    pub range_start: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range_start: None,
        }
    }

    pub fn with_range_start(mut self, offset: u64) -> Self {
        self.range_start = Some(offset);
        self
    }
}

/// Status, length and streaming body of a response.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The server honoured a range request.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Collect the whole body. For small documents such as feeds.
    pub async fn bytes(self) -> Result<Vec<u8>, TransportError> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Injectable GET-with-range transport.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and return once headers arrive.
    ///
    /// Non-success statuses are returned as responses, not errors.
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        Self::with_connect_timeout(user_agent, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    pub fn with_connect_timeout(
        user_agent: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!(url = %request.url, range_start = ?request.range_start, "GET");

        let mut builder = self.client.get(&request.url);
        if let Some(offset) = request.range_start {
            let value = HeaderValue::from_str(&format!("bytes={offset}-"))
                .map_err(|e| TransportError::Client(e.to_string()))?;
            builder = builder.header(RANGE, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(TransportError::from)
            .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Canned response served by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryResponse {
    pub status: u16,
    pub body: Bytes,
    pub chunk_size: usize,
    /// Answer range requests with 206
    pub supports_range: bool,
    /// Break the stream once this many bytes were sent, on the next request only
    pub fail_once_after: Option<u64>,
    /// Delay before every chunk
    pub chunk_delay: Option<Duration>,
}

impl MemoryResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            chunk_size: 1024,
            supports_range: false,
            fail_once_after: None,
            chunk_delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Bytes::new())
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_range_support(mut self) -> Self {
        self.supports_range = true;
        self
    }

    pub fn failing_once_after(mut self, bytes: u64) -> Self {
        self.fail_once_after = Some(bytes);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// In-memory transport keyed by URL. Unknown URLs answer 404.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    routes: Arc<Mutex<HashMap<String, MemoryResponse>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `response` for `url`, replacing any previous route.
    pub fn insert(&self, url: impl Into<String>, response: MemoryResponse) {
        lock(&self.routes).insert(url.into(), response);
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.requests).iter().filter(|r| r.url == url).count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl HttpTransport for MemoryTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        lock(&self.requests).push(request.clone());

        let route = {
            let mut routes = lock(&self.routes);
            match routes.get_mut(&request.url) {
                Some(route) => {
                    let served = route.clone();
                    route.fail_once_after = None;
                    served
                }
                None => MemoryResponse::status(404),
            }
        };

        let (status, body) = match request.range_start {
            Some(offset)
                if route.status == 200
                    && route.supports_range
                    && (offset as usize) <= route.body.len() =>
            {
                (206, route.body.slice(offset as usize..))
            }
            _ => (route.status, route.body.clone()),
        };

        let mut items: Vec<Result<Bytes, TransportError>> = Vec::new();
        let mut sent = 0u64;
        for chunk in body.chunks(route.chunk_size) {
            if let Some(limit) = route.fail_once_after {
                if sent >= limit {
                    items.push(Err(TransportError::Body("connection reset".to_string())));
                    break;
                }
            }
            sent += chunk.len() as u64;
            items.push(Ok(Bytes::copy_from_slice(chunk)));
        }

        let delay = route.chunk_delay;
        let stream = stream::iter(items)
            .then(move |item| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed();

        Ok(HttpResponse {
            status,
            content_length: Some(body.len() as u64),
            body: stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_serves_body() {
        let transport = MemoryTransport::new();
        transport.insert(
            "https://e.com/feed.yml",
            MemoryResponse::ok(&b"hello world"[..]).with_chunk_size(3),
        );

        let response = transport
            .get(HttpRequest::get("https://e.com/feed.yml"))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.content_length, Some(11));
        assert_eq!(response.bytes().await.unwrap(), b"hello world");
        assert_eq!(transport.request_count("https://e.com/feed.yml"), 1);
    }

    #[tokio::test]
    async fn test_memory_transport_unknown_url() {
        let transport = MemoryTransport::new();
        let response = transport.get(HttpRequest::get("https://e.com/x")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_memory_transport_range() {
        let transport = MemoryTransport::new();
        transport.insert(
            "https://e.com/a",
            MemoryResponse::ok(&b"0123456789"[..]).with_range_support(),
        );
        transport.insert("https://e.com/b", MemoryResponse::ok(&b"0123456789"[..]));

        let partial = transport
            .get(HttpRequest::get("https://e.com/a").with_range_start(4))
            .await
            .unwrap();
        assert!(partial.is_partial());
        assert_eq!(partial.bytes().await.unwrap(), b"456789");

        let full = transport
            .get(HttpRequest::get("https://e.com/b").with_range_start(4))
            .await
            .unwrap();
        assert_eq!(full.status, 200);
        assert_eq!(full.bytes().await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_memory_transport_fails_once() {
        let transport = MemoryTransport::new();
        transport.insert(
            "https://e.com/a",
            MemoryResponse::ok(vec![1u8; 100])
                .with_chunk_size(10)
                .failing_once_after(30),
        );

        let first = transport.get(HttpRequest::get("https://e.com/a")).await.unwrap();
        assert!(matches!(first.bytes().await, Err(TransportError::Body(_))));

        let second = transport.get(HttpRequest::get("https://e.com/a")).await.unwrap();
        assert_eq!(second.bytes().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_reqwest_transport_builds() {
        assert!(ReqwestTransport::new("app-updater-test").is_ok());
    }
}
