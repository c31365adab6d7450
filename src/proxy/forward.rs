use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{Body, Request, Response, Uri, Version};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http_client::{append_forwarded_for, strip_hop_by_hop_headers, UpstreamClient};
use crate::balancer::peer_addr;
use crate::config::HttpClientConfig;
use crate::error::{RouterError, RouterResult};
use crate::registry::Service;

/// Forwards requests to a chosen service
#[derive(Clone)]
pub struct ReverseProxy {
    pub(super) client: UpstreamClient,
    pub(super) request_timeout: Duration,
    /// Scheme clients used to reach the router, for X-Forwarded-Proto
    inbound_scheme: &'static str,
    /// Long-lived relays close when this fires
    pub(super) shutdown: CancellationToken,
}

impl ReverseProxy {
    pub fn new(
        client: UpstreamClient,
        config: &HttpClientConfig,
        inbound_tls: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            request_timeout: config.get_request_timeout(),
            inbound_scheme: if inbound_tls { "https" } else { "http" },
            shutdown,
        }
    }

    /// Forward `req` to `target` and relay the upstream response.
    ///
    /// Connection failures and timeouts surface as `BadGateway`; upstream
    /// status codes, including errors, are passed through untouched.
    pub async fn proxy_request(
        &self,
        req: Request<Body>,
        target: &Service,
    ) -> RouterResult<Response<Body>> {
        let upstream_req = self.build_upstream_request(req, target, false)?;
        debug!(
            service = %target.id,
            uri = %upstream_req.uri(),
            "Forwarding request upstream"
        );

        let response = self.send(upstream_req, target).await?;
        Ok(build_downstream_response(response))
    }

    pub(super) async fn send(
        &self,
        upstream_req: Request<Body>,
        target: &Service,
    ) -> RouterResult<Response<Body>> {
        match tokio::time::timeout(self.request_timeout, self.client.request(upstream_req)).await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(service = %target.id, error = %e, "Upstream request failed");
                Err(RouterError::bad_gateway(target.authority(), e.to_string()))
            }
            Err(_) => {
                warn!(
                    service = %target.id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Upstream request timed out"
                );
                Err(RouterError::bad_gateway(
                    target.authority(),
                    format!("no response within {:?}", self.request_timeout),
                ))
            }
        }
    }

    pub(super) fn build_upstream_request(
        &self,
        req: Request<Body>,
        target: &Service,
        keep_upgrade: bool,
    ) -> RouterResult<Request<Body>> {
        let client_ip = peer_addr(&req).map(|addr| addr.ip().to_string());
        let (mut parts, body) = req.into_parts();

        let pq = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let authority = target.authority();
        let uri: Uri = format!("{}://{}{}", target.scheme(), authority, pq)
            .parse()
            .map_err(|e| {
                RouterError::bad_gateway(&authority, format!("invalid upstream URI: {}", e))
            })?;

        let original_host = parts
            .headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| a.as_str().parse().ok()));

        parts.uri = uri;
        // The upstream client speaks HTTP/1.1 regardless of the inbound version
        parts.version = Version::HTTP_11;

        let upgrade = if keep_upgrade {
            parts.headers.get(UPGRADE).cloned()
        } else {
            None
        };
        strip_hop_by_hop_headers(&mut parts.headers);
        if let Some(upgrade) = upgrade {
            parts.headers.insert(UPGRADE, upgrade);
            parts
                .headers
                .insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        }

        let host = HeaderValue::from_str(&authority).map_err(|e| {
            RouterError::bad_gateway(&authority, format!("invalid upstream host: {}", e))
        })?;
        parts.headers.insert(HOST, host);

        if let Some(ip) = &client_ip {
            append_forwarded_for(&mut parts.headers, ip);
            if let Ok(value) = HeaderValue::from_str(ip) {
                parts.headers.entry("x-real-ip").or_insert(value);
            }
        }
        parts
            .headers
            .entry("x-forwarded-proto")
            .or_insert(HeaderValue::from_static(self.inbound_scheme));
        if let Some(host) = original_host {
            parts.headers.entry("x-forwarded-host").or_insert(host);
        }

        Ok(Request::from_parts(parts, body))
    }
}

/// Copy status and end-to-end headers; the body streams through
pub(super) fn build_downstream_response(upstream: Response<Body>) -> Response<Body> {
    let (mut parts, body) = upstream.into_parts();
    strip_hop_by_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body)
}
