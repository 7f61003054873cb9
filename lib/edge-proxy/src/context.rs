//! Per-request routing context

use chrono::{DateTime, Utc};
use edge_core::ServiceRegistration;
use hyper::header::HeaderMap;
use hyper::{body::Bytes, Method, Request};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::transform::CORRELATION_ID_HEADER;

/// State carried through one pipeline invocation.
///
/// Created when a request enters the gateway and dropped once its response
/// has been produced. Never shared between requests.
#[derive(Clone, Debug)]
pub struct RoutingContext {
    /// Correlation id: the caller's if it sent one, otherwise freshly generated
    pub correlation_id: String,
    /// Address of the connected client
    pub client_addr: Option<IpAddr>,
    /// Monotonic start of request handling
    pub started_at: Option<Instant>,
    /// Wall-clock time the request reached the edge
    pub received_at: DateTime<Utc>,
    pub method: Method,
    pub path: String,
    /// Service name once the path has been resolved
    pub service: Option<String>,
    /// Instance chosen by the load balancer
    pub selected: Option<ServiceRegistration>,
}

impl RoutingContext {
    /// Create a context from an inbound request
    pub fn from_request(request: &Request<Bytes>, client_addr: Option<IpAddr>) -> Self {
        let correlation_id =
            incoming_correlation_id(request.headers()).unwrap_or_else(generate_correlation_id);

        Self {
            correlation_id,
            client_addr,
            started_at: Some(Instant::now()),
            received_at: Utc::now(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            service: None,
            selected: None,
        }
    }

    /// Time since the request entered the gateway, if the start was recorded
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| start.elapsed())
    }

    /// Service label for logs and metrics
    pub fn service_label(&self) -> &str {
        self.service.as_deref().unwrap_or("unresolved")
    }
}

/// The caller's correlation id; blank or non-text values count as absent
pub fn incoming_correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Generate a new correlation id
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
