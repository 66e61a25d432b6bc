//! Controllers: the units of application logic a [`Router`](super::Router)
//! dispatches to.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use strest_core::{Request, Response};

use crate::network::sink::{ResponseSink, SinkError};

/// Method key matching any verb without a more specific handler.
pub const METHOD_ALL: &str = "ALL";

/// Handles every request routed to [`route`](Controller::route).
///
/// A controller answers through `sink`: zero or more `continue` responses
/// followed by one `completed` response. The sink may be kept and used
/// after `handle` returns, for example from a spawned task.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Route pattern this controller serves, e.g. `/users/:id`.
    fn route(&self) -> &str;

    /// # Errors
    ///
    /// Returns the sink error if a response could not be delivered.
    async fn handle(&self, request: Request, sink: Arc<dyn ResponseSink>) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send>>;

/// A single request handler inside a [`MethodController`].
pub trait Handler: Send + Sync {
    fn call(&self, request: Request, sink: Arc<dyn ResponseSink>) -> HandlerFuture;
}

/// [`Handler`] backed by an async closure. Built with [`handler_fn`].
pub struct HandlerFn<F>(F);

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request, Arc<dyn ResponseSink>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
{
    fn call(&self, request: Request, sink: Arc<dyn ResponseSink>) -> HandlerFuture {
        Box::pin((self.0)(request, sink))
    }
}

/// Wraps an async closure `(Request, sink) -> Result<(), SinkError>` as a
/// [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, Arc<dyn ResponseSink>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
{
    HandlerFn(f)
}

// ---------------------------------------------------------------------------
// MethodController
// ---------------------------------------------------------------------------

/// Controller that picks a handler by request method.
///
/// An exact verb match wins, then the [`METHOD_ALL`] handler. A request
/// with neither gets a 405 response through the sink.
pub struct MethodController {
    route: String,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl MethodController {
    #[must_use]
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            handlers: HashMap::new(),
        }
    }

    /// Controller with a single handler for every method.
    #[must_use]
    pub fn all(route: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::new(route).on(&[METHOD_ALL], handler)
    }

    /// Serves `methods` with `handler`. Method names are case-insensitive;
    /// a later registration for the same method replaces the earlier one.
    #[must_use]
    pub fn on(mut self, methods: &[&str], handler: impl Handler + 'static) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        for method in methods {
            self.handlers
                .insert(method.to_ascii_uppercase(), Arc::clone(&handler));
        }
        self
    }

    /// Methods with a handler, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

#[async_trait]
impl Controller for MethodController {
    fn route(&self) -> &str {
        &self.route
    }

    async fn handle(&self, request: Request, sink: Arc<dyn ResponseSink>) -> Result<(), SinkError> {
        let method = request.method();
        let handler = self
            .handlers
            .get(&method)
            .or_else(|| self.handlers.get(METHOD_ALL))
            .cloned();
        match handler {
            Some(handler) => handler.call(request, sink).await,
            None => {
                let message = format!("method {method} not allowed on {}", self.route);
                let mut response = Response::error(&request, 405, &message);
                response.put("strest.allow", self.methods().join(", "));
                sink.deliver(response).await
            }
        }
    }
}
