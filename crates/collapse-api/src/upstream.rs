//! Upstream HTTP client: the invoker behind every collapsed batch.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, Method, Uri};
use bytes::Bytes;
use tracing::debug;

use collapse_server::batcher::{InvokeError, UpstreamInvoker, UpstreamResponse};
use collapse_server::config::UpstreamSettings;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// What the proxy sends upstream on behalf of a client request.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub method: Method,
    /// Original path and query, forwarded untouched.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardedRequest {
    /// Captures what is forwarded from an inbound request.
    ///
    /// Hop-by-hop headers and `Content-Length` are dropped; the client
    /// recomputes the latter from `body`.
    pub fn new(method: Method, uri: &Uri, mut headers: HeaderMap, body: Bytes) -> Self {
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
        headers.remove(header::CONTENT_LENGTH);

        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method,
            path_and_query,
            headers,
            body,
        }
    }
}

/// Forwards requests to one upstream base URL.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// Creates a client for `base_url` with a per-call `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Creates a client from the `upstream` configuration section.
    pub fn from_settings(settings: &UpstreamSettings) -> Result<Self, reqwest::Error> {
        Self::new(
            settings.base_url.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute upstream URL for `path_and_query`.
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// Sends `request` upstream and reads the whole response body.
    pub async fn forward(&self, request: &ForwardedRequest) -> Result<UpstreamResponse, InvokeError> {
        let url = self.url_for(&request.path_and_query);
        debug!(method = %request.method, %url, "forwarding upstream");

        let response = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| self.classify(err))?;

        Ok(UpstreamResponse::new(status, body))
    }

    fn classify(&self, err: reqwest::Error) -> InvokeError {
        if err.is_timeout() {
            InvokeError::Timeout {
                duration_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_builder() {
            InvokeError::InvalidRequest(err.to_string())
        } else {
            InvokeError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl UpstreamInvoker<ForwardedRequest> for HttpUpstream {
    async fn invoke(&self, payload: &ForwardedRequest) -> Result<UpstreamResponse, InvokeError> {
        self.forward(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> ForwardedRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "0".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        ForwardedRequest::new(Method::GET, &uri.parse().unwrap(), headers, Bytes::new())
    }

    #[test]
    fn test_forwarded_request_strips_hop_by_hop_headers() {
        let request = request("/foo?x=1");

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path_and_query, "/foo?x=1");
        assert!(request.headers.get(header::HOST).is_none());
        assert!(request.headers.get(header::CONNECTION).is_none());
        assert!(request.headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(
            request.headers.get(header::ACCEPT).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_url_for_joins_base_and_path() {
        let upstream = HttpUpstream::new("http://backend:8081/", Duration::from_secs(1)).unwrap();

        assert_eq!(upstream.base_url(), "http://backend:8081");
        assert_eq!(
            upstream.url_for("/foo?x=1"),
            "http://backend:8081/foo?x=1"
        );
        assert_eq!(upstream.url_for("foo"), "http://backend:8081/foo");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_a_transport_error() {
        // Port 9 (discard) on loopback is not expected to accept connections.
        let upstream = HttpUpstream::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let request = request("/");

        let err = upstream.invoke(&request).await.unwrap_err();
        assert!(
            matches!(err, InvokeError::Transport(_) | InvokeError::Timeout { .. }),
            "unexpected error: {err:?}"
        );
    }
}
