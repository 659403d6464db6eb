//! Common traits and types for transports

use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::balancer::registry::ServerRegistry;
use crate::balancer::server::Server;
use crate::bridge::Publisher;
use crate::error::{DispatchError, Result, TransportError};

/// Outbound request, addressed either logically (service name) or concretely
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl HttpRequest {
    /// Create a request for a method and target
    pub fn new(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request, parsing the target
    pub fn get(uri: &str) -> Result<Self> {
        Ok(Self::new(Method::GET, parse_uri(uri)?))
    }

    /// Create a POST request with a body, parsing the target
    pub fn post(uri: &str, body: impl Into<Bytes>) -> Result<Self> {
        Ok(Self::new(Method::POST, parse_uri(uri)?).with_body(body))
    }

    /// Add a header
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Copy of this request aimed at another target; every other field is kept
    pub fn with_uri(&self, uri: Url) -> Self {
        Self {
            method: self.method.clone(),
            uri,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| DispatchError::InvalidRequest(format!("{}: {}", uri, e)))
}

/// A logical request whose target has been replaced by a selected server's address.
///
/// Only constructible through [`RewrittenRequest::new`], so the target always
/// matches the server it was derived from.
#[derive(Debug, Clone)]
pub struct RewrittenRequest {
    server: Server,
    request: HttpRequest,
}

impl RewrittenRequest {
    /// Rewrite `logical` for `server` using the registry's URI reconstruction
    pub fn new(
        registry: &dyn ServerRegistry,
        server: &Server,
        logical: &HttpRequest,
    ) -> Result<Self> {
        let target = registry.reconstruct_target(server, logical.uri())?;
        Ok(Self {
            server: server.clone(),
            request: logical.with_uri(target),
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn into_request(self) -> HttpRequest {
        self.request
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse<B> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: B,
}

impl HttpResponse<Bytes> {
    /// Decode the body as JSON
    pub fn json<O: DeserializeOwned>(&self) -> Result<O> {
        serde_json::from_slice(&self.body)
            .map_err(|e| DispatchError::Transport(TransportError::Decode(e)))
    }

    /// Body as UTF-8 text, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Lazily consumed response body
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Response whose metadata has resolved but whose body is still streaming
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Terminal executor for the four response shapes.
///
/// Every operation returns a cold [`Publisher`]: no network activity happens
/// until it is subscribed, and dropping the subscription cancels the call.
pub trait Transport: Send + Sync + 'static {
    /// Single buffered response
    fn exchange(&self, request: HttpRequest) -> Publisher<HttpResponse<Bytes>>;

    /// Single response with a streaming body
    fn exchange_streamed(&self, request: HttpRequest) -> Publisher<StreamingResponse>;

    /// Raw body chunks
    fn raw_byte_stream(&self, request: HttpRequest) -> Publisher<Bytes>;

    /// Body decoded as a sequence of values
    fn decoded_stream<O>(&self, request: HttpRequest) -> Publisher<O>
    where
        O: DeserializeOwned + Send + 'static;
}
