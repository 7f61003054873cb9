//! HTTP forwarding to a selected backend instance

use edge_core::{CoreError, ServiceRegistration};
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HOST};
use hyper::{body::Bytes, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// The outbound boundary of the pipeline: send a request to one instance.
///
/// Connection errors map to `CoreError::UpstreamFailure`, elapsed deadlines
/// to `CoreError::UpstreamTimeout`. Implementations never retry.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        target: &ServiceRegistration,
        request: Request<Bytes>,
    ) -> edge_core::Result<Response<Bytes>>;
}

/// HTTP request forwarder with connection pooling and a per-request timeout
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new())
            .build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URI of `target` for the request's path and query
    pub fn target_uri(target: &ServiceRegistration, original: &Uri) -> edge_core::Result<Uri> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", target.authority(), path_and_query);
        url.parse::<Uri>().map_err(|e| CoreError::UpstreamFailure {
            service: target.service_name.clone(),
            reason: format!("invalid target uri {}: {}", url, e),
        })
    }

    async fn exchange(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, String> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| e.to_string())?;

        let (mut parts, body) = response.into_parts();
        let bytes = body.collect().await.map_err(|e| e.to_string())?.to_bytes();
        strip_hop_by_hop(&mut parts.headers);

        debug!("Backend responded with status {} ({} bytes)", parts.status, bytes.len());
        Ok(Response::from_parts(parts, bytes))
    }
}

#[async_trait::async_trait]
impl Upstream for RequestForwarder {
    async fn send(
        &self,
        target: &ServiceRegistration,
        request: Request<Bytes>,
    ) -> edge_core::Result<Response<Bytes>> {
        let (mut parts, body) = request.into_parts();
        parts.uri = Self::target_uri(target, &parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);
        // Let the client derive Host from the backend's authority
        parts.headers.remove(HOST);

        debug!("Forwarding {} {}", parts.method, parts.uri);
        let forwarded = Request::from_parts(parts, Full::new(body));

        match tokio_timeout(self.timeout, self.exchange(forwarded)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => {
                warn!(
                    service = %target.service_name,
                    instance_id = %target.instance_id,
                    "Backend request error: {}",
                    reason
                );
                Err(CoreError::UpstreamFailure {
                    service: target.service_name.clone(),
                    reason,
                })
            }
            Err(_) => {
                warn!(
                    service = %target.service_name,
                    instance_id = %target.instance_id,
                    "Backend request timeout after {:?}",
                    self.timeout
                );
                Err(CoreError::UpstreamTimeout {
                    service: target.service_name.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Check if header is hop-by-hop (should not be forwarded)
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}
