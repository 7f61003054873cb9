//! Middleware framework for request/response processing around a forward

use crate::context::RoutingContext;
use anyhow::Result;
use edge_core::CoreError;
use hyper::{body::Bytes, Request, Response};
use std::sync::Arc;
use tracing::{debug, span, Instrument, Level};

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called after an instance is selected, before the request is forwarded
    async fn on_request(
        &self,
        _context: &RoutingContext,
        _request: &mut Request<Bytes>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called on every response before it is returned to the caller,
    /// including responses generated for routing failures
    async fn on_response(
        &self,
        _context: &RoutingContext,
        _response: &mut Response<Bytes>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when routing fails
    async fn on_error(&self, _context: &RoutingContext, _error: &CoreError) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middleware: Vec::new(),
        }
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Process request through all middleware
    pub async fn on_request(
        &self,
        context: &RoutingContext,
        request: &mut Request<Bytes>,
    ) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context, request)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(
        &self,
        context: &RoutingContext,
        response: &mut Response<Bytes>,
    ) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, response)
                .instrument(span)
                .await?;
        }
        Ok(())
    }

    /// Process error through all middleware
    pub async fn on_error(&self, context: &RoutingContext, error: &CoreError) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error)
                .instrument(span)
                .await?;
        }
        Ok(())
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging middleware that logs forwarded requests and their outcome
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(
        &self,
        context: &RoutingContext,
        request: &mut Request<Bytes>,
    ) -> Result<()> {
        let target = context
            .selected
            .as_ref()
            .map(|s| s.authority())
            .unwrap_or_default();
        debug!(
            correlation_id = %context.correlation_id,
            service = %context.service_label(),
            target = %target,
            "Forwarding {} {} (headers: {})",
            context.method,
            request.uri(),
            request.headers().len()
        );
        Ok(())
    }

    async fn on_response(
        &self,
        context: &RoutingContext,
        response: &mut Response<Bytes>,
    ) -> Result<()> {
        let duration_ms = context
            .elapsed()
            .map(|d| d.as_millis())
            .unwrap_or_default();
        debug!(
            correlation_id = %context.correlation_id,
            service = %context.service_label(),
            "Response: {} {} -> {} (duration: {}ms)",
            context.method,
            context.path,
            response.status().as_u16(),
            duration_ms
        );
        Ok(())
    }

    async fn on_error(&self, context: &RoutingContext, error: &CoreError) -> Result<()> {
        debug!(
            correlation_id = %context.correlation_id,
            "Error: {} {} - {}",
            context.method,
            context.path,
            error
        );
        Ok(())
    }
}
