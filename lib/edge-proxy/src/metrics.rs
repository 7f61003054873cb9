//! Prometheus metrics middleware for observability

use crate::context::RoutingContext;
use crate::middleware::Middleware;
use anyhow::Result;
use edge_core::CoreError;
use hyper::{body::Bytes, Response};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector for routed requests
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests that reached a response, by service
    pub requests_total: CounterVec,
    /// Responses by status code
    pub responses_total: CounterVec,
    /// Routing failures by error code
    pub routing_errors_total: CounterVec,
    /// End-to-end latency at the edge, by service
    pub request_duration_seconds: HistogramVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Total routed requests"),
            &["service"],
        )?;

        let responses_total = CounterVec::new(
            Opts::new("gateway_responses_total", "Total responses by status"),
            &["status"],
        )?;

        let routing_errors_total = CounterVec::new(
            Opts::new("gateway_routing_errors_total", "Routing failures by kind"),
            &["kind"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Request latency at the edge in seconds",
            ),
            &["service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;
        registry.register(Box::new(routing_errors_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            requests_total,
            responses_total,
            routing_errors_total,
            request_duration_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Records request counts, statuses, latency and routing failures
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_response(
        &self,
        context: &RoutingContext,
        response: &mut Response<Bytes>,
    ) -> Result<()> {
        let service = context.service_label();
        let status = response.status().as_u16().to_string();
        debug!("Recording response metrics for {} -> {}", service, status);

        self.collector
            .requests_total
            .with_label_values(&[service])
            .inc();
        self.collector
            .responses_total
            .with_label_values(&[status.as_str()])
            .inc();

        if let Some(elapsed) = context.elapsed() {
            self.collector
                .request_duration_seconds
                .with_label_values(&[service])
                .observe(elapsed.as_secs_f64());
        }

        Ok(())
    }

    async fn on_error(&self, context: &RoutingContext, error: &CoreError) -> Result<()> {
        debug!("Recording routing error for {}: {}", context.service_label(), error);
        self.collector
            .routing_errors_total
            .with_label_values(&[error.error_code()])
            .inc();
        Ok(())
    }
}
