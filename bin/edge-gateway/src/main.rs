use anyhow::Result;
use edge_core::ServiceRegistry;
use edge_proxy::{
    HealthCheckMonitor, LoggingMiddleware, MetricsCollector, MetricsMiddleware, MiddlewareChain,
    PipelineConfig, RequestForwarder, RequestTransform, ResponseTransform, Router,
    RoutingPipeline,
};
use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;

use config::{GatewayConfig, LoggingConfig};

/// Shared state handed to every connection
struct Gateway {
    pipeline: RoutingPipeline,
    metrics: MetricsCollector,
    admin_enabled: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(&config.logging);

    info!("Starting edge-gateway...");

    // Create service registry and seed static instances
    let registry = Arc::new(ServiceRegistry::new());
    for registration in config.static_registrations() {
        let service = registration.service_name.clone();
        registry.register(&service, registration).await?;
    }
    info!(
        "Service registry initialized with {} services",
        registry.list_services().await.len()
    );

    // Initialize request forwarder
    let forwarder = Arc::new(RequestForwarder::new(config.upstream_timeout()));
    info!(
        "Request forwarder initialized with {:?} timeout",
        forwarder.timeout()
    );

    // Initialize metrics collector
    let metrics = MetricsCollector::new()?;
    info!("Metrics collector initialized");

    // Initialize middleware chain
    let middleware = MiddlewareChain::new()
        .add(LoggingMiddleware)
        .add(MetricsMiddleware::new(metrics.clone()))
        .add(RequestTransform)
        .add(ResponseTransform::new().with_gateway_name(&config.gateway_name)?);
    info!("Middleware chain initialized with {} stages", middleware.len());

    let router = Router::new(config.routes.clone());
    info!("Router initialized with {} routes", router.routes().len());

    let pipeline = RoutingPipeline::new(
        registry.clone(),
        router,
        forwarder,
        middleware,
        PipelineConfig {
            strategy: config.load_balancing,
            exclude_unhealthy: config.exclude_unhealthy,
        },
    );
    info!("Routing pipeline initialized with {:?} load balancing", config.load_balancing);

    let health_task = if config.health_check.enabled {
        Some(HealthCheckMonitor::new(config.health_check.clone(), registry.clone()).spawn())
    } else {
        info!("Health check monitor disabled");
        None
    };

    if !config.admin_enabled {
        warn!("Registry management endpoints disabled");
    }

    let gateway = Arc::new(Gateway {
        pipeline,
        metrics,
        admin_enabled: config.admin_enabled,
    });

    let listener = TcpListener::bind(&config.listen).await?;
    info!("HTTP server listening on {}", config.listen);

    tokio::select! {
        result = accept_connections(listener, gateway) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    if let Some(task) = health_task {
        task.abort();
    }
    info!("edge-gateway stopped");
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Accept HTTP connections in a loop
async fn accept_connections(listener: TcpListener, gateway: Arc<Gateway>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, peer_addr, gateway.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let path = parts.uri.path().to_string();

    debug!("{} {} from {}", parts.method, path, peer_addr);

    let response = if path == "/healthz" {
        text_response(StatusCode::OK, "text/plain", Bytes::from("OK\n"))
    } else if path == "/metrics" && parts.method == Method::GET {
        match gateway.metrics.gather() {
            Ok(text) => {
                text_response(StatusCode::OK, "text/plain; version=0.0.4", Bytes::from(text))
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from("Failed to gather metrics\n"),
                )
            }
        }
    } else if gateway.admin_enabled && admin::is_admin_path(&path) {
        admin::handle_admin(gateway.pipeline.registry(), &parts.method, &path, &body).await
    } else {
        let request = Request::from_parts(parts, body);
        gateway.pipeline.handle(request, Some(peer_addr.ip())).await
    };

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Full::new(body)))
}

fn text_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
