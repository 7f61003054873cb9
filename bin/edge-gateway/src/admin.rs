//! Registry management endpoints
//!
//! The only write entry points into the registry from outside the process:
//! orchestrators and health checkers announce and retire instances here.

use edge_core::{CoreError, ErrorResponse, HealthStatus, ServiceRegistration, ServiceRegistry};
use edge_proxy::error_response;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{body::Bytes, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Path prefix of the management surface
pub const ADMIN_PREFIX: &str = "/_registry";

/// Body of a registration request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest {
    /// Optional; must match the service in the path when present
    service_name: Option<String>,
    instance_id: String,
    address: String,
    port: u16,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    health: HealthStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSummary {
    service: String,
    instances: usize,
}

pub fn is_admin_path(path: &str) -> bool {
    path == ADMIN_PREFIX || path.starts_with(&format!("{}/", ADMIN_PREFIX))
}

/// Dispatch a management request
pub async fn handle_admin(
    registry: &ServiceRegistry,
    method: &Method,
    path: &str,
    body: &Bytes,
) -> Response<Bytes> {
    let segments: Vec<&str> = path
        .trim_start_matches(ADMIN_PREFIX)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (method, segments.as_slice()) {
        (&Method::GET, []) => {
            let mut summaries = Vec::new();
            for service in registry.list_services().await {
                let instances = registry.instance_count(&service).await;
                summaries.push(ServiceSummary { service, instances });
            }
            json_response(StatusCode::OK, &summaries)
        }
        (&Method::GET, [service]) => json_response(StatusCode::OK, &registry.list(service).await),
        (&Method::POST, [service]) => register(registry, service, body).await,
        (&Method::DELETE, [service, instance_id]) => {
            if registry.deregister(service, instance_id).await {
                info!(service = %service, instance_id = %instance_id, "Instance deregistered");
            }
            empty_response(StatusCode::NO_CONTENT)
        }
        (_, [] | [_] | [_, _]) => {
            let body = ErrorResponse::new(
                "METHOD_NOT_ALLOWED",
                format!("{} is not supported on {}", method, path),
                StatusCode::METHOD_NOT_ALLOWED.as_u16(),
            );
            json_response(StatusCode::METHOD_NOT_ALLOWED, &body)
        }
        _ => error_response(&CoreError::RouteNotFound(path.to_string())),
    }
}

async fn register(registry: &ServiceRegistry, service: &str, body: &Bytes) -> Response<Bytes> {
    let request: RegistrationRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&CoreError::InvalidRegistration(format!(
                "malformed registration body: {}",
                e
            )))
        }
    };

    let registration = ServiceRegistration {
        service_name: request.service_name.unwrap_or_else(|| service.to_string()),
        instance_id: request.instance_id,
        address: request.address,
        port: request.port,
        metadata: request.metadata,
        health: request.health,
    };

    match registry.register(service, registration.clone()).await {
        Ok(()) => {
            info!(
                service = %service,
                instance_id = %registration.instance_id,
                "Instance registered at {}",
                registration.authority()
            );
            json_response(StatusCode::CREATED, &registration)
        }
        Err(e) => {
            warn!(service = %service, "Registration rejected: {}", e);
            error_response(&e)
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => error_response(&CoreError::Internal(e.to_string())),
    }
}

fn empty_response(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}
