use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Body, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};

use crate::config::HttpClientConfig;

/// Pooled client for http and https upstreams
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Build the shared upstream client.
///
/// - One instance per router so the connection pool is reused across requests
/// - rustls with webpki roots for https upstreams, plain TCP otherwise
pub fn build_client(config: &HttpClientConfig) -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false); // allow absolute-form https URIs through to rustls
    http.set_nodelay(true);
    http.set_connect_timeout(Some(config.get_connect_timeout()));

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder()
        .pool_idle_timeout(config.get_pool_idle_timeout())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build::<_, Body>(https)
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Remove RFC 7230 hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    // Collect before removal; the Connection header itself is hop-by-hop
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
}

/// Append `client_ip` to X-Forwarded-For, keeping any earlier hops
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}
