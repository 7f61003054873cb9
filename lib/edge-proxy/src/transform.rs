//! Header transforms applied to every proxied request and response

use crate::context::{incoming_correlation_id, RoutingContext};
use crate::middleware::Middleware;
use anyhow::Result;
use chrono::SecondsFormat;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Request, Response};
use std::net::IpAddr;
use tracing::debug;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const GATEWAY_TIMESTAMP_HEADER: &str = "x-gateway-timestamp";
pub const GATEWAY_HEADER: &str = "x-gateway";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";

/// Value of the `X-Gateway` marker
pub const DEFAULT_GATEWAY_NAME: &str = "edge-gateway";

/// Headers stripped from backend responses by default
pub const DEFAULT_STRIPPED_HEADERS: &[&str] = &["server", "x-powered-by"];

/// Adds correlation, forwarded-for and edge timestamp headers to outbound
/// requests. Every step checks before it sets, so reapplying is harmless.
#[derive(Debug, Default, Clone)]
pub struct RequestTransform;

impl RequestTransform {
    pub fn apply(&self, context: &RoutingContext, headers: &mut HeaderMap) -> Result<()> {
        // Keep a caller's id; a blank one is replaced by the context's
        let correlation_id = incoming_correlation_id(headers)
            .unwrap_or_else(|| context.correlation_id.clone());
        headers.insert(CORRELATION_ID_HEADER, HeaderValue::from_str(&correlation_id)?);

        if let Some(client) = context.client_addr {
            append_forwarded_for(headers, client)?;
        }

        if !headers.contains_key(GATEWAY_TIMESTAMP_HEADER) {
            let timestamp = context
                .received_at
                .to_rfc3339_opts(SecondsFormat::Millis, true);
            headers.insert(GATEWAY_TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp)?);
        }

        Ok(())
    }
}

/// Append the client to the forwarded-for chain unless it is already the last hop
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) -> Result<()> {
    let client = client.to_string();
    let existing: Vec<&[u8]> = headers
        .get_all(FORWARDED_FOR_HEADER)
        .iter()
        .map(|v| v.as_bytes())
        .collect();

    let value = if existing.is_empty() {
        HeaderValue::from_str(&client)?
    } else {
        let chain = existing.join(&b", "[..]);
        let last_hop = chain.rsplit(|b| *b == b',').next().unwrap_or(&[]);
        if last_hop.trim_ascii() == client.as_bytes() {
            return Ok(());
        }
        let mut joined = chain;
        joined.extend_from_slice(b", ");
        joined.extend_from_slice(client.as_bytes());
        HeaderValue::from_bytes(&joined)?
    };

    headers.insert(FORWARDED_FOR_HEADER, value);
    Ok(())
}

#[async_trait::async_trait]
impl Middleware for RequestTransform {
    fn name(&self) -> &'static str {
        "RequestTransform"
    }

    async fn on_request(
        &self,
        context: &RoutingContext,
        request: &mut Request<Bytes>,
    ) -> Result<()> {
        self.apply(context, request.headers_mut())
    }
}

/// Marks responses as coming from the edge, reports processing time and
/// strips headers that reveal the backend's stack.
#[derive(Debug, Clone)]
pub struct ResponseTransform {
    gateway_name: HeaderValue,
    stripped_headers: Vec<String>,
}

impl ResponseTransform {
    pub fn new() -> Self {
        Self {
            gateway_name: HeaderValue::from_static(DEFAULT_GATEWAY_NAME),
            stripped_headers: DEFAULT_STRIPPED_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }

    /// Use a custom value for the `X-Gateway` marker
    pub fn with_gateway_name(mut self, name: &str) -> Result<Self> {
        self.gateway_name = HeaderValue::from_str(name)?;
        Ok(self)
    }

    pub fn apply(&self, context: &RoutingContext, headers: &mut HeaderMap) -> Result<()> {
        // The edge owns this header; overwrite whatever the backend sent
        headers.insert(GATEWAY_HEADER, self.gateway_name.clone());

        if let Some(elapsed) = context.elapsed() {
            let millis = elapsed.as_secs_f64() * 1000.0;
            headers.insert(
                PROCESSING_TIME_HEADER,
                HeaderValue::from_str(&format!("{:.2}", millis))?,
            );
        }

        if !headers.contains_key(CORRELATION_ID_HEADER) {
            headers.insert(
                CORRELATION_ID_HEADER,
                HeaderValue::from_str(&context.correlation_id)?,
            );
        }

        for name in &self.stripped_headers {
            if headers.remove(name.as_str()).is_some() {
                debug!("Stripped response header {}", name);
            }
        }

        Ok(())
    }
}

impl Default for ResponseTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Middleware for ResponseTransform {
    fn name(&self) -> &'static str {
        "ResponseTransform"
    }

    async fn on_response(
        &self,
        context: &RoutingContext,
        response: &mut Response<Bytes>,
    ) -> Result<()> {
        self.apply(context, response.headers_mut())
    }
}
