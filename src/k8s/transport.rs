// HTTP transport for the API server, with TLS and auth taken from the connection descriptor
use super::USER_AGENT;
use super::client::Query;
use crate::config::ConnectionDescriptor;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Identity};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};
use url::Url;

pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

/// Raw body of a streaming response
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}

/// One request against the API server. `path` is relative to the base url.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Query,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Query::default(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Look up a header by case-insensitive name
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Issues requests against one API server.
///
/// `send` is a plain request/response exchange; `stream` hands back the raw
/// body of a long-lived response for the watch engine to frame.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// `Error::Api` for non-2xx responses, `Error::Http` for network failures
    async fn send(&self, request: ApiRequest) -> Result<Value>;

    /// # Errors
    ///
    /// Same classification as [`Transport::send`] for the response head
    async fn stream(&self, request: ApiRequest) -> Result<ByteStream>;
}

/// reqwest backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport from a connection descriptor
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS material or a header cannot be used
    pub fn new(descriptor: &ConnectionDescriptor) -> Result<Self> {
        descriptor.validate()?;
        install_crypto_provider();

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .user_agent(USER_AGENT)
            .default_headers(default_headers(descriptor)?)
            .danger_accept_invalid_certs(!descriptor.reject_unauthorized);

        if let Some(ca) = &descriptor.ca {
            builder = builder.add_root_certificate(Certificate::from_pem(ca.as_bytes())?);
        }

        if let (Some(cert), Some(key)) = (&descriptor.cert, &descriptor.key) {
            let mut pem = cert.clone().into_bytes();
            pem.push(b'\n');
            pem.extend_from_slice(key.as_bytes());
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        debug!(
            "🔧 HTTP transport for {} (verify tls: {})",
            descriptor.base_url, descriptor.reject_unauthorized
        );

        Ok(Self {
            base_url: descriptor.base_url.clone(),
            http: builder.build()?,
        })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    fn prepare(&self, request: &ApiRequest) -> Result<reqwest::RequestBuilder> {
        let url = self.url(&request.path)?;
        let mut builder = self.http.request(request.method.into(), url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        // json() leaves an explicit content-type alone, so merge patches keep theirs
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        Ok(builder)
    }

    fn failure(request: &ApiRequest, status: reqwest::StatusCode, bytes: &[u8]) -> Error {
        Error::Api {
            method: request.method.to_string(),
            url: request.path.clone(),
            status: status.as_u16(),
            body: decode_body(bytes),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<Value> {
        trace!(method = %request.method, path = %request.path, query = ?request.query, "sending request");

        let response = self.prepare(&request)?.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            Ok(decode_body(&bytes))
        } else {
            debug!("❌ {} {} -> {}", request.method, request.path, status);
            Err(Self::failure(&request, status, &bytes))
        }
    }

    async fn stream(&self, request: ApiRequest) -> Result<ByteStream> {
        trace!(method = %request.method, path = %request.path, query = ?request.query, "opening stream");

        let response = self.prepare(&request)?.send().await?;
        let status = response.status();

        if !status.is_success() {
            let bytes = response.bytes().await?;
            return Err(Self::failure(&request, status, &bytes));
        }

        Ok(response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed())
    }
}

/// Decode a response body: empty is `null`, JSON is parsed, anything else is
/// returned as a string.
#[must_use]
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn default_headers(descriptor: &ConnectionDescriptor) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (name, value) in &descriptor.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let mut header_value = HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        if header_name == AUTHORIZATION {
            header_value.set_sensitive(true);
        }
        headers.insert(header_name, header_value);
    }

    if let Some(authorization) = &descriptor.authorization {
        let mut value = HeaderValue::from_str(authorization).map_err(|e| Error::InvalidHeader {
            name: AUTHORIZATION.as_str().to_string(),
            reason: e.to_string(),
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}

/// rustls needs a process-wide provider once more than one backend is compiled in
fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
