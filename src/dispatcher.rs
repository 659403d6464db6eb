//! Request dispatcher - runs the four response shapes either straight through the
//! transport or through a load-balanced command

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

use crate::balancer::registry::ServerRegistry;
use crate::balancer::server::Server;
use crate::bridge::{self, Publisher, SwitchMap};
use crate::command::{DispatchCommand, ExecutionListener, ListenerRegistry, RetryPolicy};
use crate::error::Result;
use crate::transport::{HttpRequest, HttpResponse, RewrittenRequest, StreamingResponse, Transport};

/// Lazy, cancellable result of a dispatch
pub type DispatchStream<R> = BoxStream<'static, Result<R>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Unary,
    Streaming,
}

/// Decorates a [`Transport`] with server selection, retry/failover and
/// execution listeners.
///
/// Without a load balancer every call is a passthrough: the request goes to the
/// transport untouched, with no selection, retry or listener notification.
pub struct RequestDispatcher<T> {
    transport: Arc<T>,
    load_balancer: Option<Arc<dyn ServerRegistry>>,
    retry_policy: RetryPolicy,
    listeners: ListenerRegistry,
}

impl<T: Transport> RequestDispatcher<T> {
    /// Passthrough dispatcher over `transport`
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            load_balancer: None,
            retry_policy: RetryPolicy::default(),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Route requests through `registry`
    pub fn with_load_balancer(self, registry: Arc<dyn ServerRegistry>) -> Self {
        self.with_optional_load_balancer(Some(registry))
    }

    /// Route requests through `registry` if present, otherwise pass through
    pub fn with_optional_load_balancer(mut self, registry: Option<Arc<dyn ServerRegistry>>) -> Self {
        self.load_balancer = registry;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_listener(self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.register(listener);
        self
    }

    /// Add a listener; dispatches started afterwards notify it
    pub fn register_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.register(listener);
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// The load balancer, if one is configured
    pub fn load_balancer(&self) -> Option<&Arc<dyn ServerRegistry>> {
        self.load_balancer.as_ref()
    }

    pub fn is_load_balanced(&self) -> bool {
        self.load_balancer.is_some()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Exactly one buffered response, or one error
    pub fn exchange(&self, request: HttpRequest) -> DispatchStream<HttpResponse<Bytes>> {
        self.dispatch(request, Shape::Unary, |transport: &T, request| transport.exchange(request))
    }

    /// Exactly one response whose body is consumed lazily, or one error
    pub fn exchange_streamed(&self, request: HttpRequest) -> DispatchStream<StreamingResponse> {
        self.dispatch(request, Shape::Unary, |transport: &T, request| {
            transport.exchange_streamed(request)
        })
    }

    /// Raw body chunks
    pub fn raw_byte_stream(&self, request: HttpRequest) -> DispatchStream<Bytes> {
        self.dispatch(request, Shape::Streaming, |transport: &T, request| {
            transport.raw_byte_stream(request)
        })
    }

    /// Body decoded as a sequence of `O`
    pub fn decoded_stream<O>(&self, request: HttpRequest) -> DispatchStream<O>
    where
        O: DeserializeOwned + Send + 'static,
    {
        self.dispatch(request, Shape::Streaming, |transport: &T, request| {
            transport.decoded_stream::<O>(request)
        })
    }

    /// Fresh command per call, so listener and policy changes apply immediately
    fn build_command(&self, registry: Arc<dyn ServerRegistry>) -> DispatchCommand {
        DispatchCommand::new(registry, self.retry_policy.clone(), self.listeners.snapshot())
    }

    fn dispatch<R, F>(&self, request: HttpRequest, shape: Shape, execute: F) -> DispatchStream<R>
    where
        R: Send + 'static,
        F: Fn(&T, HttpRequest) -> Publisher<R> + Send + Sync + 'static,
    {
        let Some(registry) = self.load_balancer.clone() else {
            debug!(method = %request.method(), uri = %request.uri(), "Dispatching without load balancer");
            return bridge::into_stream(execute(self.transport.as_ref(), request)).boxed();
        };

        let command = self.build_command(registry.clone());
        let transport = self.transport.clone();
        let execute = Arc::new(execute);
        let logical = request.clone();

        let work = move |server: Server| -> DispatchStream<R> {
            let transport = transport.clone();
            let execute = execute.clone();
            let target = stream::once(future::ready(RewrittenRequest::new(
                registry.as_ref(),
                &server,
                &logical,
            )));

            SwitchMap::new(target, move |rewritten: RewrittenRequest| {
                debug!(server = %rewritten.server(), target = %rewritten.request().uri(), "Executing rewritten request");
                bridge::into_stream((execute.as_ref())(transport.as_ref(), rewritten.into_request()))
            })
            .boxed()
        };

        match shape {
            Shape::Unary => command.submit_single(request, work).boxed(),
            Shape::Streaming => command.submit(request, work).boxed(),
        }
    }
}

impl<T> std::fmt::Debug for RequestDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("load_balanced", &self.load_balancer.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
