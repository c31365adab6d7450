use hyper::header::{HeaderMap, CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::{Body, Request, Response, StatusCode};
use tracing::{debug, info, warn};

use super::forward::{build_downstream_response, ReverseProxy};
use crate::error::{RouterError, RouterResult};
use crate::registry::Service;

fn header_has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Request asks to switch to the WebSocket protocol
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    header_has_token(req.headers(), CONNECTION, "upgrade")
        && header_has_token(req.headers(), UPGRADE, "websocket")
}

fn validate_upgrade_request<B>(req: &Request<B>) -> RouterResult<()> {
    let headers = req.headers();
    if headers.get(SEC_WEBSOCKET_KEY).is_none() {
        return Err(RouterError::invalid_request(
            "WebSocket upgrade without Sec-WebSocket-Key",
        ));
    }
    let version_ok = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "13");
    if !version_ok {
        return Err(RouterError::invalid_request(
            "unsupported Sec-WebSocket-Version, expected 13",
        ));
    }
    Ok(())
}

impl ReverseProxy {
    /// Forward a WebSocket handshake to `target` and, once upstream agrees,
    /// relay bytes in both directions until either side closes or the
    /// router shuts down.
    ///
    /// A non-101 upstream answer is returned to the client as a normal
    /// response.
    pub async fn proxy_websocket(
        &self,
        mut req: Request<Body>,
        target: &Service,
    ) -> RouterResult<Response<Body>> {
        validate_upgrade_request(&req)?;

        let downstream = hyper::upgrade::on(&mut req);
        let upstream_req = self.build_upstream_request(req, target, true)?;
        let mut upstream_res = self.send(upstream_req, target).await?;

        if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                service = %target.id,
                status = %upstream_res.status(),
                "Upstream declined WebSocket upgrade"
            );
            return Ok(build_downstream_response(upstream_res));
        }

        let upstream = hyper::upgrade::on(&mut upstream_res);
        let shutdown = self.shutdown.clone();
        let service_id = target.id.clone();
        tokio::spawn(async move {
            let (mut client_io, mut upstream_io) = match tokio::try_join!(downstream, upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(service = %service_id, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };
            info!(service = %service_id, "WebSocket relay opened");

            tokio::select! {
                result = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io) => {
                    match result {
                        Ok((sent, received)) => {
                            info!(service = %service_id, sent, received, "WebSocket relay closed");
                        }
                        Err(e) => {
                            debug!(service = %service_id, error = %e, "WebSocket relay ended with error");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(service = %service_id, "WebSocket relay closed for shutdown");
                }
            }
        });

        // Hand the client upstream's handshake headers, Sec-WebSocket-Accept included
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = upstream_res.headers().clone();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(version: &str) -> Request<Body> {
        Request::builder()
            .uri("/ws")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, version)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_detects_upgrade() {
        assert!(is_websocket_upgrade(&upgrade_request("13")));

        let plain = Request::builder()
            .header(CONNECTION, "keep-alive")
            .body(Body::empty())
            .unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn test_validate_upgrade_request() {
        assert!(validate_upgrade_request(&upgrade_request("13")).is_ok());
        assert!(validate_upgrade_request(&upgrade_request("8")).is_err());

        let no_key = Request::builder()
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .body(Body::empty())
            .unwrap();
        assert!(validate_upgrade_request(&no_key).is_err());
    }
}
