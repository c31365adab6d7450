use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, VARY,
};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::response::error_response;
use crate::config::{CorsConfig, FirewallConfig, RateLimitConfig};
use crate::error::RouterError;
use crate::ratelimit::{RateLimitStatus, RateLimiter};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const RATE_LIMIT_LIMIT: &str = "x-rate-limit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";

const MAX_REQUEST_ID_LEN: usize = 128;
const DEFAULT_RULE_KEY: &str = "*";

/// Keep a sane caller-supplied id when `trust_supplied`, otherwise mint
/// one. The id is written back onto the request so upstreams see the same
/// value.
pub fn assign_request_id(req: &mut Request<Body>, trust_supplied: bool) -> String {
    let supplied = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| trust_supplied && !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string);

    let id = supplied.unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    id
}

pub fn set_request_id(headers: &mut HeaderMap, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

pub fn log_access(
    request_id: &str,
    method: &Method,
    path: &str,
    status: StatusCode,
    elapsed: Duration,
    client_ip: Option<IpAddr>,
) {
    let client_ip = client_ip.map(|ip| ip.to_string()).unwrap_or_default();
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        latency_ms = elapsed.as_millis() as u64,
        client_ip = %client_ip,
        "Request completed"
    );
}

/// Refuse the request when the first firewall rule it matches is a deny
pub fn check_firewall(
    firewall: &FirewallConfig,
    client_ip: Option<IpAddr>,
    scheme: &str,
    port: Option<u16>,
) -> Result<(), Response<Body>> {
    match firewall.blocking_rule(client_ip, scheme, port) {
        None => Ok(()),
        Some(rule) => {
            let client_ip = client_ip.map(|ip| ip.to_string()).unwrap_or_default();
            warn!(
                client_ip = %client_ip,
                source = %rule.source,
                "Request blocked by firewall"
            );
            Err(error_response(&RouterError::forbidden("request blocked by firewall")))
        }
    }
}

/// Baseline hardening headers; values set by the upstream win
pub fn apply_security_headers(headers: &mut HeaderMap, tls: bool) {
    let mut pairs = vec![
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("x-xss-protection", "1; mode=block"),
        ("referrer-policy", "strict-origin-when-cross-origin"),
    ];
    if tls {
        pairs.push(("strict-transport-security", "max-age=31536000; includeSubDomains"));
    }
    for (name, value) in pairs {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert(HeaderValue::from_static(value));
    }
}

/// `OPTIONS` is always answered by the router itself while CORS is on
pub fn is_preflight<B>(req: &Request<B>) -> bool {
    req.method() == Method::OPTIONS
}

pub fn preflight_response(cors: &CorsConfig, origin: Option<&str>, req: &Request<Body>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    debug!(
        origin = origin.unwrap_or(""),
        requested_method = req
            .headers()
            .get(ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
        "Answering CORS preflight"
    );
    apply_cors(cors, origin, response.headers_mut(), true);
    response
}

fn join_header(values: &[String]) -> Option<HeaderValue> {
    if values.is_empty() {
        return None;
    }
    HeaderValue::from_str(&values.join(", ")).ok()
}

/// Add CORS headers for `origin`. Refused origins get no headers at all.
pub fn apply_cors(cors: &CorsConfig, origin: Option<&str>, headers: &mut HeaderMap, preflight: bool) {
    let Some(allowed) = cors.allow_origin(origin) else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&allowed) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    if allowed != "*" {
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
    if cors.allow_credentials {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }

    if preflight {
        if let Some(methods) = join_header(&cors.allowed_methods) {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Some(allowed_headers) = join_header(&cors.allowed_headers) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allowed_headers);
        }
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(cors.max_age));
    } else if let Some(exposed) = join_header(&cors.exposed_headers) {
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed);
    }
}

/// Admission check for one request.
///
/// Returns the header values to attach when admitted, or the finished
/// `429` response when refused. `None` means rate limiting is off.
pub fn admit(
    limiter: &RateLimiter,
    config: &RateLimitConfig,
    method: &Method,
    path: &str,
    client_ip: Option<IpAddr>,
) -> Result<Option<RateLimitStatus>, Response<Body>> {
    if !config.enabled {
        return Ok(None);
    }

    let (rule_key, limit, window) = match config.rule_for(path, method.as_str()) {
        Some(rule) => (rule.path.as_str(), rule.limit, rule.get_window()),
        None => (DEFAULT_RULE_KEY, config.limit, config.get_window()),
    };
    let client = client_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let key = format!("{}|{}", client, rule_key);

    let admitted = limiter.allow(&key, limit, window);
    let status = limiter.status(&key, limit, window);
    if admitted {
        return Ok(Some(status));
    }

    info!(key = %key, limit, path = %path, "Request rejected by rate limiter");
    let mut response = error_response(&RouterError::rate_limited(key, limit, status.reset));
    apply_rate_limit_headers(response.headers_mut(), &status);
    Err(response)
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    let pairs = [
        (RATE_LIMIT_LIMIT, status.limit as i64),
        (RATE_LIMIT_REMAINING, status.remaining as i64),
        (RATE_LIMIT_RESET, status.reset),
    ];
    for (name, value) in pairs {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitRule;

    #[test]
    fn test_request_id_generated_and_kept() {
        let mut req = Request::new(Body::empty());
        let id = assign_request_id(&mut req, true);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(req.headers()[REQUEST_ID_HEADER], id.as_str());

        let mut req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(assign_request_id(&mut req, true), "abc-123");

        let mut req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_ne!(assign_request_id(&mut req, false), "abc-123");
    }

    #[test]
    fn test_preflight_headers() {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        assert!(is_preflight(&req));

        let cors = CorsConfig::default();
        let response = preflight_response(&cors, Some("https://app.example"), &req);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers[ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("PATCH"));
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn test_refused_origin_gets_no_headers() {
        let cors = CorsConfig {
            allowed_origins: vec!["https://app.example".to_string()],
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        apply_cors(&cors, Some("https://evil.example"), &mut headers, false);
        assert!(headers.is_empty());

        apply_cors(&cors, Some("https://app.example"), &mut headers, false);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(headers[VARY], "Origin");
    }

    #[test]
    fn test_firewall_deny_renders_forbidden() {
        use crate::config::FirewallRule;

        let firewall = FirewallConfig {
            enabled: true,
            rules: vec![FirewallRule {
                action: "deny".to_string(),
                source: "192.168.0.0/16".to_string(),
                protocol: None,
                ports: Vec::new(),
            }],
        };
        let blocked: Option<IpAddr> = "192.168.4.2".parse().ok();
        let other: Option<IpAddr> = "10.0.0.1".parse().ok();

        assert!(check_firewall(&firewall, other, "http", Some(8080)).is_ok());
        let refused = check_firewall(&firewall, blocked, "http", Some(8080)).unwrap_err();
        assert_eq!(refused.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_security_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-frame-options", HeaderValue::from_static("SAMEORIGIN"));
        apply_security_headers(&mut headers, false);

        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(!headers.contains_key("strict-transport-security"));

        apply_security_headers(&mut headers, true);
        assert_eq!(
            headers["strict-transport-security"],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[test]
    fn test_admission_by_rule() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig {
            enabled: true,
            limit: 100,
            rules: vec![RateLimitRule {
                path: "/api".to_string(),
                method: None,
                limit: 2,
                window: 60,
            }],
            ..Default::default()
        };
        let ip: Option<IpAddr> = "10.0.0.1".parse().ok();

        for _ in 0..2 {
            let status = admit(&limiter, &config, &Method::GET, "/api/a", ip)
                .unwrap()
                .unwrap();
            assert_eq!(status.limit, 2);
        }
        let refused = admit(&limiter, &config, &Method::GET, "/api/b", ip).unwrap_err();
        assert_eq!(refused.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(refused.headers()[RATE_LIMIT_LIMIT], "2");
        assert_eq!(refused.headers()[RATE_LIMIT_REMAINING], "0");
        assert!(refused.headers().contains_key(RATE_LIMIT_RESET));

        // Other paths fall back to the default limit under their own key
        assert!(admit(&limiter, &config, &Method::GET, "/other", ip).is_ok());
    }

    #[test]
    fn test_admission_disabled() {
        let limiter = RateLimiter::new();
        let config = RateLimitConfig::default();
        assert!(admit(&limiter, &config, &Method::GET, "/", None)
            .unwrap()
            .is_none());
    }
}
