//! Document transport.
//!
//! Schemas and model documents are fetched through the [`Transport`] trait so
//! hosts can plug in their own client. Three adapters are provided: an
//! in-memory map, a URL-prefix-to-directory mapping, and HTTP via `reqwest`
//! (`remote` feature).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;

#[cfg(feature = "remote")]
use std::time::Duration;

/// Default timeout for HTTP requests (10 seconds).
#[cfg(feature = "remote")]
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn append(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
}

impl FetchRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Headers::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// HTTP status, if the transport has one.
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Body,
}

impl FetchResponse {
    pub fn json(value: Value) -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: Body::Json(value),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: Body::Text(text.into()),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.map_or(true, |status| status < 400)
    }

    /// Fail on error statuses; otherwise parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Status` for a status of 400 or above, or
    /// `TransportError::InvalidJson` if a text body does not parse.
    pub fn into_json(self, url: &str) -> Result<Value, TransportError> {
        if let Some(status) = self.status.filter(|s| *s >= 400) {
            return Err(TransportError::Status {
                url: url.to_string(),
                status,
            });
        }
        match self.body {
            Body::Json(value) => Ok(value),
            Body::Text(text) => serde_json::from_str(&text).map_err(|source| {
                TransportError::InvalidJson {
                    url: url.to_string(),
                    source,
                }
            }),
        }
    }
}

/// Fetches documents by URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError>;
}

fn unsupported_method(request: &FetchRequest) -> Option<TransportError> {
    (!request.method.eq_ignore_ascii_case("GET")).then(|| TransportError::Unsupported {
        url: request.url.clone(),
        message: format!("method {} is not supported", request.method),
    })
}

/// Serves documents from a map. Records every URL requested.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    documents: Mutex<HashMap<String, FetchResponse>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(self, url: &str, document: Value) -> Self {
        self.insert(url, document);
        self
    }

    pub fn insert(&self, url: &str, document: Value) {
        self.insert_response(url, FetchResponse::json(document));
    }

    pub fn insert_response(&self, url: &str, response: FetchResponse) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), response);
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.url.clone());
        if let Some(err) = unsupported_method(&request) {
            return Err(err);
        }
        let url = crate::uri::base(&request.url);
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::NotFound {
                url: request.url.clone(),
            })
    }
}

/// Serves URLs under `prefix` from files under `root`.
///
/// `https://example.com/schemas` mapped onto `site/` turns
/// `https://example.com/schemas/order.json` into `site/order.json`. A URL
/// without an extension falls back to the same name with `.json` appended.
#[derive(Debug, Clone)]
pub struct DirTransport {
    prefix: String,
    root: PathBuf,
}

impl DirTransport {
    pub fn new(prefix: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            root: root.into(),
        }
    }

    /// Local path for `url`, or `None` when it lies outside the prefix.
    pub fn local_path(&self, url: &str) -> Option<PathBuf> {
        let url = crate::uri::base(url);
        let remainder = url.strip_prefix(&self.prefix)?;
        if !(remainder.is_empty() || remainder.starts_with('/')) {
            return None;
        }
        let relative = Path::new(remainder.trim_start_matches('/'));
        // keep lookups inside root
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl Transport for DirTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        if let Some(err) = unsupported_method(&request) {
            return Err(err);
        }
        let path = self
            .local_path(&request.url)
            .ok_or_else(|| TransportError::Unsupported {
                url: request.url.clone(),
                message: format!("outside {}", self.prefix),
            })?;

        let path = if path.extension().is_none() && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            path.with_extension("json")
        } else {
            path
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(FetchResponse::text(content).with_header("content-type", "application/json")),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(TransportError::NotFound {
                url: request.url.clone(),
            }),
            Err(source) => Err(TransportError::ReadError { path, source }),
        }
    }
}

/// Fetches over HTTP(S) with `reqwest`.
#[cfg(feature = "remote")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "remote")]
impl HttpTransport {
    /// A client with a 10 second timeout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::NetworkError` if the client cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| TransportError::NetworkError {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "remote")]
#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransportError::Unsupported {
                url: request.url.clone(),
                message: format!("invalid method {}", request.method),
            })?;
        let url = crate::uri::base(&request.url).to_string();

        let mut builder = self.client.request(method, &url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| TransportError::NetworkError {
                url: url.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.append(name.as_str(), value);
            }
        }
        let text = response
            .text()
            .await
            .map_err(|source| TransportError::NetworkError { url, source })?;

        Ok(FetchResponse {
            status: Some(status),
            headers,
            body: Body::Text(text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn headers_are_case_insensitive() {
        let response = FetchResponse::json(json!({}))
            .with_header("Content-Type", "application/json")
            .with_header("Link", "<a>; rel=\"describedby\"")
            .with_header("link", "<b>; rel=\"next\"");
        assert_eq!(response.headers.get("content-type"), Some("application/json"));
        assert_eq!(response.headers.get_all("LINK").count(), 2);
    }

    #[test]
    fn into_json_checks_status_and_parses_text() {
        let ok = FetchResponse::text(r#"{"a": 1}"#).with_status(200);
        assert_eq!(ok.into_json("u").unwrap(), json!({"a": 1}));

        let err = FetchResponse::text("gone").with_status(404).into_json("u");
        assert!(matches!(err, Err(TransportError::Status { status: 404, .. })));

        let err = FetchResponse::text("not json").into_json("u");
        assert!(matches!(err, Err(TransportError::InvalidJson { .. })));
    }

    #[tokio::test]
    async fn memory_transport_serves_and_records() {
        let transport = MemoryTransport::new().with("http://x/a", json!({"type": "string"}));
        let response = transport.fetch(FetchRequest::get("http://x/a#/definitions")).await.unwrap();
        assert_eq!(response.body, Body::Json(json!({"type": "string"})));

        let missing = transport.fetch(FetchRequest::get("http://x/b")).await;
        assert!(matches!(missing, Err(TransportError::NotFound { .. })));
        assert_eq!(transport.requests(), vec!["http://x/a#/definitions", "http://x/b"]);
    }

    #[tokio::test]
    async fn memory_transport_rejects_other_methods() {
        let transport = MemoryTransport::new().with("u", json!(null));
        let mut request = FetchRequest::get("u");
        request.method = "POST".to_string();
        let result = transport.fetch(request).await;
        assert!(matches!(result, Err(TransportError::Unsupported { .. })));
    }

    #[test]
    fn dir_transport_maps_prefix() {
        let transport = DirTransport::new("https://example.com/schemas/", "/srv/site");
        assert_eq!(
            transport.local_path("https://example.com/schemas/order.json"),
            Some(PathBuf::from("/srv/site/order.json"))
        );
        assert_eq!(transport.local_path("https://example.com/schemasx/a"), None);
        assert_eq!(transport.local_path("https://other.com/schemas/a"), None);
        assert_eq!(transport.local_path("https://example.com/schemas/../secret"), None);
    }

    #[tokio::test]
    async fn dir_transport_reads_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("order.json"), r#"{"type": "object"}"#).unwrap();
        let transport = DirTransport::new("https://example.com/schemas", dir.path());

        let value = transport
            .fetch(FetchRequest::get("https://example.com/schemas/order.json"))
            .await
            .unwrap()
            .into_json("order")
            .unwrap();
        assert_eq!(value["type"], "object");

        // extension fallback
        let value = transport
            .fetch(FetchRequest::get("https://example.com/schemas/order"))
            .await
            .unwrap()
            .into_json("order")
            .unwrap();
        assert_eq!(value["type"], "object");

        let result = transport
            .fetch(FetchRequest::get("https://example.com/schemas/nope.json"))
            .await;
        assert!(matches!(result, Err(TransportError::NotFound { .. })));
    }

    #[cfg(feature = "remote")]
    mod remote {
        use super::*;

        #[tokio::test]
        async fn http_transport_fetches_json() {
            let mut server = mockito::Server::new_async().await;
            let mock = server
                .mock("GET", "/schemas/item")
                .with_status(200)
                .with_header("content-type", "application/json; profile=\"/schemas/item\"")
                .with_body(r#"{"type": "object"}"#)
                .create_async()
                .await;

            let transport = HttpTransport::new().unwrap();
            let url = format!("{}/schemas/item", server.url());
            let response = transport.fetch(FetchRequest::get(&url)).await.unwrap();
            assert_eq!(response.status, Some(200));
            assert!(response
                .headers
                .get("Content-Type")
                .unwrap()
                .contains("profile="));
            assert_eq!(response.into_json(&url).unwrap()["type"], "object");
            mock.assert_async().await;
        }

        #[tokio::test]
        async fn http_transport_reports_error_status() {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("GET", "/missing")
                .with_status(404)
                .create_async()
                .await;

            let transport = HttpTransport::new().unwrap();
            let url = format!("{}/missing", server.url());
            let response = transport.fetch(FetchRequest::get(&url)).await.unwrap();
            assert!(!response.is_success());
            let err = response.into_json(&url).unwrap_err();
            assert!(matches!(err, TransportError::Status { status: 404, .. }));
        }

        #[tokio::test]
        async fn http_transport_network_failure() {
            let transport = HttpTransport::new().unwrap();
            let result = transport
                .fetch(FetchRequest::get("http://127.0.0.1:1/unreachable"))
                .await;
            assert!(matches!(result, Err(TransportError::NetworkError { .. })));
        }
    }
}
