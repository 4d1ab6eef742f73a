//! Chunked HTTP Transport
//!
//! Adapters talk to upstream HTTP APIs through the narrow [`ChunkTransport`]
//! trait so tests can feed canned byte streams. [`ReqwestTransport`] is the
//! production implementation.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{GatewayError, Result};

/// Response body delivered as it arrives
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// A JSON POST to an upstream path
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// Path relative to the transport's base URL
    pub path: String,
    /// JSON body
    pub body: serde_json::Value,
    /// Extra headers for this request only
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    /// Create a request
    pub fn new(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            body,
            headers: Vec::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a bearer `Authorization` header
    #[must_use]
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {token}"))
    }
}

/// Sends requests and yields streaming bodies
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Send a request; non-success statuses become errors
    async fn send(&self, request: TransportRequest) -> Result<ByteStream>;

    /// Send a request and decode the whole body as JSON
    async fn request_json(&self, request: TransportRequest) -> Result<serde_json::Value> {
        let mut body = self.send(request).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(serde_json::from_slice(&buf)?)
    }
}

/// Configuration for [`ReqwestTransport`]
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Base URL every request path is joined to
    pub base_url: String,
    /// Headers sent with every request
    pub headers: Vec<(String, String)>,
    /// Outbound proxy URL
    pub proxy: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl HttpTransportConfig {
    /// Config for a base URL with no extra headers
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            headers: vec![
                ("content-type".into(), "application/json".into()),
                ("accept".into(), "text/event-stream".into()),
                ("cache-control".into(), "no-cache".into()),
            ],
            proxy: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Add a default header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Route requests through a proxy
    #[must_use]
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

/// HTTP transport over `reqwest`
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client from config
    pub fn new(config: &HttpTransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(header_map(&config.headers)?);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ChunkTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<ByteStream> {
        let url = self.url(&request.path);
        let response = self
            .client
            .post(&url)
            .headers(header_map(&request.headers)?)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(url = %url, status = status.as_u16(), "Upstream rejected request");
            return Err(GatewayError::from_status(status.as_u16(), &body));
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(GatewayError::from)),
        ))
    }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Config(format!("invalid value for header {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let transport = ReqwestTransport::new(&HttpTransportConfig::new("https://api.example.com/v1/")).unwrap();
        assert_eq!(
            transport.url("/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let config = HttpTransportConfig::new("http://localhost").with_header("bad header", "x");
        assert!(matches!(
            ReqwestTransport::new(&config),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_bearer_header() {
        let request = TransportRequest::new("/x", serde_json::json!({})).with_bearer("tok");
        assert_eq!(
            request.headers,
            vec![("authorization".to_string(), "Bearer tok".to_string())]
        );
    }
}
