//! Request routing for the edge gateway
//!
//! - Load balancing strategies over registry snapshots
//! - Request/response header transforms and the middleware chain
//! - Path routing, upstream forwarding and the routing pipeline
//! - Health probing of registered instances

pub mod context;
pub mod forwarder;
pub mod health_check;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod router;
pub mod transform;

pub use context::RoutingContext;
pub use forwarder::{RequestForwarder, Upstream};
pub use health_check::{HealthCheckConfig, HealthCheckMonitor, HealthChecker};
pub use load_balancer::{
    LeastConnectionsLoadBalancer, LoadBalancer, LoadBalancingStrategy, RandomLoadBalancer,
    RoundRobinLoadBalancer, WeightedLoadBalancer,
};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain};
pub use pipeline::{error_response, PipelineConfig, RoutingPipeline};
pub use router::{ResolvedRoute, RouteRule, Router};
pub use transform::{RequestTransform, ResponseTransform};
