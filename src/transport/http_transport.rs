//! HTTP transport implementation

use bytes::Bytes;
use futures::stream::{self, Stream};
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bridge::{Emitter, Publisher};
use crate::config::ClientConfig;
use crate::error::{DispatchError, Result, TransportError};
use crate::transport::codec::JsonStreamDecoder;
use crate::transport::traits::{BodyStream, HttpRequest, HttpResponse, StreamingResponse, Transport};

/// Transport executing requests with `reqwest`.
///
/// The read timeout bounds the whole call for `exchange`. For the streaming
/// shapes it bounds the wait for the response head and for each body chunk, so
/// long-lived streams stay open as long as data keeps arriving.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    read_timeout: Option<Duration>,
}

impl ReqwestTransport {
    /// Create a new transport from configuration
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            read_timeout: Some(Duration::from_millis(config.read_timeout_ms)),
        })
    }

    /// Wrap an existing client; no read timeout is applied
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }
}

/// Send a request; error statuses become [`TransportError::Status`].
///
/// `deadline` bounds the call until the body has been read.
async fn send(
    client: &Client,
    request: HttpRequest,
    deadline: Option<Duration>,
) -> std::result::Result<reqwest::Response, TransportError> {
    let url = request.uri().clone();
    let mut builder = client
        .request(request.method().clone(), url.clone())
        .headers(request.headers().clone());
    if let Some(body) = request.body() {
        builder = builder.body(body.clone());
    }
    if let Some(deadline) = deadline {
        builder = builder.timeout(deadline);
    }

    debug!(method = %request.method(), url = %url, "Sending request");

    let response = builder.send().await.map_err(|e| {
        if e.is_connect() {
            TransportError::Connect(format!("{}: {}", url, e))
        } else {
            TransportError::Http(e)
        }
    })?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, "Request failed with error status");
        return Err(TransportError::Status { status, url, body });
    }

    Ok(response)
}

/// Start a streaming call, reporting failure to the subscriber.
///
/// `idle` bounds the wait for the response head.
async fn send_or_report<T>(
    client: &Client,
    request: HttpRequest,
    idle: Option<Duration>,
    emitter: &Emitter<T>,
) -> Option<reqwest::Response> {
    let result = match idle {
        Some(limit) => tokio::time::timeout(limit, send(client, request, None))
            .await
            .unwrap_or(Err(TransportError::ReadTimeout(limit))),
        None => send(client, request, None).await,
    };

    match result {
        Ok(response) => Some(response),
        Err(e) => {
            emitter.error(e.into()).await;
            None
        }
    }
}

/// Body chunks, failing with [`TransportError::ReadTimeout`] when no chunk
/// arrives within `idle`. Ends after the first error.
fn idle_body<S>(body: S, idle: Option<Duration>) -> impl Stream<Item = Result<Bytes>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    stream::unfold((Box::pin(body), false), move |(mut body, failed)| async move {
        if failed {
            return None;
        }
        let next = match idle {
            Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                Ok(next) => next.map(|chunk| chunk.map_err(TransportError::from)),
                Err(_) => Some(Err(TransportError::ReadTimeout(limit))),
            },
            None => body.next().await.map(|chunk| chunk.map_err(TransportError::from)),
        }?
        .map_err(DispatchError::from);
        let failed = next.is_err();
        Some((next, (body, failed)))
    })
}

impl Transport for ReqwestTransport {
    fn exchange(&self, request: HttpRequest) -> Publisher<HttpResponse<Bytes>> {
        let client = self.client.clone();
        let deadline = self.read_timeout;
        Publisher::new(move |emitter| async move {
            let result = async {
                let response = send(&client, request, deadline).await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await.map_err(TransportError::from)?;
                Ok::<_, DispatchError>(HttpResponse { status, headers, body })
            }
            .await;
            emitter.send(result).await;
        })
    }

    fn exchange_streamed(&self, request: HttpRequest) -> Publisher<StreamingResponse> {
        let client = self.client.clone();
        let idle = self.read_timeout;
        Publisher::new(move |emitter| async move {
            let Some(response) = send_or_report(&client, request, idle, &emitter).await else {
                return;
            };
            let status = response.status();
            let headers = response.headers().clone();
            let body: BodyStream = idle_body(response.bytes_stream(), idle).boxed();
            emitter.emit(StreamingResponse { status, headers, body }).await;
        })
    }

    fn raw_byte_stream(&self, request: HttpRequest) -> Publisher<Bytes> {
        let client = self.client.clone();
        let idle = self.read_timeout;
        Publisher::new(move |emitter| async move {
            let Some(response) = send_or_report(&client, request, idle, &emitter).await else {
                return;
            };
            let mut body = Box::pin(idle_body(response.bytes_stream(), idle));
            while let Some(chunk) = body.next().await {
                if !emitter.send(chunk).await {
                    break;
                }
            }
        })
    }

    fn decoded_stream<O>(&self, request: HttpRequest) -> Publisher<O>
    where
        O: DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        let idle = self.read_timeout;
        Publisher::new(move |emitter| async move {
            let Some(response) = send_or_report(&client, request, idle, &emitter).await else {
                return;
            };
            let mut decoder = JsonStreamDecoder::<O>::new();
            let mut body = Box::pin(idle_body(response.bytes_stream(), idle));
            while let Some(chunk) = body.next().await {
                let values = match chunk {
                    Ok(chunk) => decoder
                        .decode(&chunk)
                        .map_err(|e| DispatchError::from(TransportError::Decode(e))),
                    Err(e) => Err(e),
                };
                match values {
                    Ok(values) => {
                        for value in values {
                            if !emitter.emit(value).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        emitter.error(e).await;
                        return;
                    }
                }
            }
            match decoder.finish() {
                Ok(Some(value)) => {
                    emitter.emit(value).await;
                }
                Ok(None) => {}
                Err(e) => {
                    emitter.error(TransportError::Decode(e).into()).await;
                }
            }
        })
    }
}
