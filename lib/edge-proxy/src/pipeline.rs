//! Routing pipeline: resolve, select, transform, forward

use crate::context::RoutingContext;
use crate::forwarder::Upstream;
use crate::load_balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::middleware::MiddlewareChain;
use crate::router::Router;
use dashmap::DashMap;
use edge_core::{CoreError, ErrorResponse, ServiceRegistration, ServiceRegistry};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{body::Bytes, Request, Response, StatusCode, Uri};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pipeline settings
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub strategy: LoadBalancingStrategy,
    /// Drop `Unhealthy` instances before selection
    pub exclude_unhealthy: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            exclude_unhealthy: true,
        }
    }
}

/// Composition root for proxied requests.
///
/// Every failure is turned into a response for the request that caused it;
/// nothing here mutates the registry.
pub struct RoutingPipeline {
    registry: Arc<ServiceRegistry>,
    router: Router,
    upstream: Arc<dyn Upstream>,
    middleware: MiddlewareChain,
    config: PipelineConfig,
    // One balancer per service name so round-robin cursors stay independent
    balancers: DashMap<String, Arc<dyn LoadBalancer>>,
}

/// Returns the selected instance to its balancer when dropped, so a request
/// abandoned mid-forward still releases its slot.
struct SelectionLease {
    balancer: Arc<dyn LoadBalancer>,
    instance: ServiceRegistration,
}

impl Drop for SelectionLease {
    fn drop(&mut self) {
        self.balancer.release(&self.instance);
    }
}

impl RoutingPipeline {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        router: Router,
        upstream: Arc<dyn Upstream>,
        middleware: MiddlewareChain,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            router,
            upstream,
            middleware,
            config,
            balancers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The balancer owned by a service, created on first use
    pub fn balancer_for(&self, service: &str) -> Arc<dyn LoadBalancer> {
        if let Some(balancer) = self.balancers.get(service) {
            return balancer.clone();
        }
        self.balancers
            .entry(service.to_string())
            .or_insert_with(|| self.config.strategy.build())
            .clone()
    }

    /// Candidate snapshot for a service after health filtering
    pub async fn candidates(&self, service: &str) -> Vec<ServiceRegistration> {
        let mut instances = self.registry.list(service).await;
        if self.config.exclude_unhealthy {
            instances.retain(|i| !i.is_unhealthy());
        }
        instances
    }

    /// Handle one inbound request end to end
    pub async fn handle(
        &self,
        request: Request<Bytes>,
        client_addr: Option<IpAddr>,
    ) -> Response<Bytes> {
        let mut context = RoutingContext::from_request(&request, client_addr);

        let mut response = match self.route(&mut context, request).await {
            Ok(response) => response,
            Err(error) => {
                match &error {
                    CoreError::UpstreamFailure { .. } | CoreError::UpstreamTimeout { .. } => {
                        warn!(correlation_id = %context.correlation_id, "{}", error)
                    }
                    _ => debug!(correlation_id = %context.correlation_id, "{}", error),
                }
                if let Err(e) = self.middleware.on_error(&context, &error).await {
                    debug!("Middleware on_error error: {}", e);
                }
                error_response(&error)
            }
        };

        if let Err(e) = self.middleware.on_response(&context, &mut response).await {
            debug!("Middleware on_response error: {}", e);
        }
        response
    }

    async fn route(
        &self,
        context: &mut RoutingContext,
        mut request: Request<Bytes>,
    ) -> edge_core::Result<Response<Bytes>> {
        let resolved = self
            .router
            .resolve(request.uri().path())
            .ok_or_else(|| CoreError::RouteNotFound(request.uri().path().to_string()))?;
        context.service = Some(resolved.service.clone());

        let rewritten = rewrite_uri(request.uri(), &resolved.path)?;
        *request.uri_mut() = rewritten;

        // Checked before balancer_for so unknown names never get a balancer
        let candidates = self.candidates(&resolved.service).await;
        if candidates.is_empty() {
            return Err(CoreError::NoInstanceAvailable(resolved.service));
        }
        let balancer = self.balancer_for(&resolved.service);
        let selected = balancer
            .select(&candidates)
            .ok_or_else(|| CoreError::NoInstanceAvailable(resolved.service.clone()))?;
        let _lease = SelectionLease {
            balancer: balancer.clone(),
            instance: selected.clone(),
        };

        debug!(
            correlation_id = %context.correlation_id,
            service = %resolved.service,
            instance_id = %selected.instance_id,
            strategy = balancer.name(),
            "Selected instance"
        );
        context.selected = Some(selected.clone());

        // A half-applied transform must not reach the backend
        if let Err(e) = self.middleware.on_request(context, &mut request).await {
            warn!(
                correlation_id = %context.correlation_id,
                "Middleware on_request error: {}",
                e
            );
            return Err(CoreError::Internal(format!("request middleware failed: {}", e)));
        }

        self.upstream.send(&selected, request).await
    }
}

/// Replace the path of a request URI, keeping its query
fn rewrite_uri(original: &Uri, path: &str) -> edge_core::Result<Uri> {
    let path_and_query = match original.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    path_and_query.parse::<Uri>().map_err(|e| {
        CoreError::Internal(format!("invalid rewritten uri {}: {}", path_and_query, e))
    })
}

/// Build the structured error response for a routing failure
pub fn error_response(error: &CoreError) -> Response<Bytes> {
    let body = ErrorResponse::from(error);
    let status =
        StatusCode::from_u16(body.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Bytes::from(body.to_json()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;
    use crate::router::RouteRule;
    use crate::transform::{
        RequestTransform, ResponseTransform, CORRELATION_ID_HEADER, FORWARDED_FOR_HEADER,
        GATEWAY_HEADER, GATEWAY_TIMESTAMP_HEADER, PROCESSING_TIME_HEADER,
    };
    use edge_core::HealthStatus;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Forwarded {
        instance_id: String,
        uri: String,
        correlation_id: Option<String>,
        forwarded_for: Option<String>,
        has_timestamp: bool,
    }

    /// Upstream that records each call and answers like a chatty backend
    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<Forwarded>>,
        slow_path: Option<&'static str>,
    }

    impl RecordingUpstream {
        fn calls(&self) -> Vec<Forwarded> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Upstream for RecordingUpstream {
        async fn send(
            &self,
            target: &ServiceRegistration,
            request: Request<Bytes>,
        ) -> edge_core::Result<Response<Bytes>> {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            self.calls.lock().unwrap().push(Forwarded {
                instance_id: target.instance_id.clone(),
                uri: request.uri().to_string(),
                correlation_id: header(CORRELATION_ID_HEADER),
                forwarded_for: header(FORWARDED_FOR_HEADER),
                has_timestamp: request.headers().contains_key(GATEWAY_TIMESTAMP_HEADER),
            });

            if self.slow_path == Some(request.uri().path()) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Server", "Kestrel")
                .header("X-Powered-By", "ASP.NET")
                .body(Bytes::from(target.instance_id.clone()))
                .unwrap())
        }
    }

    struct FailingUpstream;

    #[async_trait::async_trait]
    impl Upstream for FailingUpstream {
        async fn send(
            &self,
            target: &ServiceRegistration,
            _request: Request<Bytes>,
        ) -> edge_core::Result<Response<Bytes>> {
            Err(CoreError::UpstreamFailure {
                service: target.service_name.clone(),
                reason: "connection refused".to_string(),
            })
        }
    }

    fn chain() -> MiddlewareChain {
        MiddlewareChain::new()
            .add(RequestTransform)
            .add(ResponseTransform::new())
    }

    fn pipeline_with(
        registry: Arc<ServiceRegistry>,
        upstream: Arc<dyn Upstream>,
        strategy: LoadBalancingStrategy,
    ) -> RoutingPipeline {
        RoutingPipeline::new(
            registry,
            Router::new(Vec::new()),
            upstream,
            chain(),
            PipelineConfig {
                strategy,
                exclude_unhealthy: true,
            },
        )
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    fn client() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)))
    }

    async fn register(registry: &ServiceRegistry, service: &str, id: &str, port: u16) {
        registry
            .register(service, ServiceRegistration::new(service, id, "10.0.0.1", port))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_end_to_end() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        register(&registry, "orders", "B", 8002).await;
        register(&registry, "orders", "C", 8003).await;

        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline =
            pipeline_with(registry.clone(), upstream.clone(), LoadBalancingStrategy::RoundRobin);

        let mut bodies = Vec::new();
        for _ in 0..3 {
            let response = pipeline.handle(get("/orders/items"), client()).await;
            assert_eq!(response.status(), StatusCode::OK);
            bodies.push(response.into_body());
        }
        assert_eq!(bodies, vec!["A", "B", "C"]);

        registry.deregister("orders", "C").await;
        let response = pipeline.handle(get("/orders/items"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body();
        assert!(body == "A" || body == "B", "routed to {:?}", body);
    }

    #[tokio::test]
    async fn test_empty_service_returns_no_instance_without_forwarding() {
        let registry = Arc::new(ServiceRegistry::new());
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = pipeline_with(registry, upstream.clone(), LoadBalancingStrategy::RoundRobin);

        let response = pipeline.handle(get("/inventory/stock"), client()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[GATEWAY_HEADER], "edge-gateway");
        let body: ErrorResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error_code, "NO_INSTANCE_AVAILABLE");
        assert_eq!(body.status_code, 503);
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_instances_are_skipped() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        register(&registry, "orders", "B", 8002).await;
        registry.set_health("orders", "A", HealthStatus::Unhealthy).await;

        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline =
            pipeline_with(registry.clone(), upstream.clone(), LoadBalancingStrategy::RoundRobin);

        for _ in 0..3 {
            pipeline.handle(get("/orders/"), client()).await;
        }
        assert!(upstream.calls().iter().all(|c| c.instance_id == "B"));

        registry.set_health("orders", "B", HealthStatus::Unhealthy).await;
        let response = pipeline.handle(get("/orders/"), client()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_filter_can_be_disabled() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        registry.set_health("orders", "A", HealthStatus::Unhealthy).await;

        let pipeline = RoutingPipeline::new(
            registry,
            Router::new(Vec::new()),
            Arc::new(RecordingUpstream::default()),
            chain(),
            PipelineConfig {
                strategy: LoadBalancingStrategy::RoundRobin,
                exclude_unhealthy: false,
            },
        );
        let response = pipeline.handle(get("/orders/"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_and_response_headers() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = pipeline_with(registry, upstream.clone(), LoadBalancingStrategy::RoundRobin);

        let request = Request::builder()
            .uri("/orders/items/7?expand=lines")
            .header("X-Correlation-ID", "trace-42")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request, client()).await;

        let call = &upstream.calls()[0];
        assert_eq!(call.uri, "/items/7?expand=lines");
        assert_eq!(call.correlation_id.as_deref(), Some("trace-42"));
        assert_eq!(call.forwarded_for.as_deref(), Some("198.51.100.4"));
        assert!(call.has_timestamp);

        let headers = response.headers();
        assert!(!headers.contains_key("server"));
        assert!(!headers.contains_key("x-powered-by"));
        assert_eq!(headers[GATEWAY_HEADER], "edge-gateway");
        assert_eq!(headers[CORRELATION_ID_HEADER], "trace-42");
        assert!(headers.contains_key(PROCESSING_TIME_HEADER));
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_bad_gateway() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let pipeline = pipeline_with(
            registry.clone(),
            Arc::new(FailingUpstream),
            LoadBalancingStrategy::RoundRobin,
        );

        let response = pipeline.handle(get("/orders/items"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: ErrorResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error_code, "UPSTREAM_FAILURE");

        // Registry untouched by the failure
        assert_eq!(registry.instance_count("orders").await, 1);
    }

    #[tokio::test]
    async fn test_unresolvable_path_is_not_found() {
        let registry = Arc::new(ServiceRegistry::new());
        let pipeline =
            pipeline_with(registry, Arc::new(FailingUpstream), LoadBalancingStrategy::RoundRobin);

        let response = pipeline.handle(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_configured_route() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = RoutingPipeline::new(
            registry,
            Router::new(vec![RouteRule {
                path_prefix: "/api/v1/orders".to_string(),
                service: "orders".to_string(),
                strip_prefix: true,
            }]),
            upstream.clone(),
            chain(),
            PipelineConfig::default(),
        );

        let response = pipeline.handle(get("/api/v1/orders/9"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.calls()[0].uri, "/9");
    }

    #[tokio::test]
    async fn test_round_robin_cursor_is_per_service() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "o1", 8001).await;
        register(&registry, "orders", "o2", 8002).await;
        register(&registry, "billing", "b1", 9001).await;
        register(&registry, "billing", "b2", 9002).await;

        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = pipeline_with(registry, upstream.clone(), LoadBalancingStrategy::RoundRobin);

        pipeline.handle(get("/orders/"), client()).await;
        pipeline.handle(get("/billing/"), client()).await;
        pipeline.handle(get("/orders/"), client()).await;
        pipeline.handle(get("/billing/"), client()).await;

        let ids: Vec<_> = upstream.calls().into_iter().map(|c| c.instance_id).collect();
        assert_eq!(ids, vec!["o1", "b1", "o2", "b2"]);
    }

    #[tokio::test]
    async fn test_cancelled_request_releases_selection() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        register(&registry, "orders", "B", 8002).await;

        let upstream = Arc::new(RecordingUpstream {
            calls: Mutex::new(Vec::new()),
            slow_path: Some("/slow"),
        });
        let pipeline = pipeline_with(
            registry.clone(),
            upstream.clone(),
            LoadBalancingStrategy::LeastConnections,
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            pipeline.handle(get("/orders/slow"), client()),
        )
        .await;
        assert!(abandoned.is_err());

        // A's in-flight slot was returned, so A is the least loaded again
        let response = pipeline.handle(get("/orders/fast"), client()).await;
        assert_eq!(response.into_body(), "A");
        assert_eq!(registry.instance_count("orders").await, 2);
    }

    #[tokio::test]
    async fn test_unknown_services_do_not_create_balancers() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = pipeline_with(registry, upstream.clone(), LoadBalancingStrategy::RoundRobin);

        for i in 0..500 {
            let response = pipeline.handle(get(&format!("/junk-{}/x", i)), client()).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert!(pipeline.balancers.is_empty());
        assert!(upstream.calls().is_empty());

        pipeline.handle(get("/orders/x"), client()).await;
        assert_eq!(pipeline.balancers.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_correlation_id_matches_forwarded_and_echoed() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = pipeline_with(registry, upstream.clone(), LoadBalancingStrategy::RoundRobin);

        let request = Request::builder()
            .uri("/orders/items")
            .header("X-Correlation-ID", " ")
            .body(Bytes::new())
            .unwrap();
        let response = pipeline.handle(request, client()).await;

        let forwarded = upstream.calls()[0].correlation_id.clone().unwrap();
        assert!(!forwarded.trim().is_empty());
        assert_eq!(response.headers()[CORRELATION_ID_HEADER], forwarded.as_str());
    }

    struct RejectingMiddleware;

    #[async_trait::async_trait]
    impl Middleware for RejectingMiddleware {
        async fn on_request(
            &self,
            _context: &RoutingContext,
            _request: &mut Request<Bytes>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("header rejected")
        }
    }

    #[tokio::test]
    async fn test_request_middleware_failure_is_not_forwarded() {
        let registry = Arc::new(ServiceRegistry::new());
        register(&registry, "orders", "A", 8001).await;
        let upstream = Arc::new(RecordingUpstream::default());
        let pipeline = RoutingPipeline::new(
            registry,
            Router::new(Vec::new()),
            upstream.clone(),
            chain().add(RejectingMiddleware),
            PipelineConfig::default(),
        );

        let response = pipeline.handle(get("/orders/items"), client()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body.error_code, "INTERNAL_ERROR");
        assert!(upstream.calls().is_empty());
    }

    #[test]
    fn test_rewrite_uri_keeps_query() {
        let original: Uri = "/orders/items?page=3".parse().unwrap();
        assert_eq!(rewrite_uri(&original, "/items").unwrap(), "/items?page=3");
    }
}
