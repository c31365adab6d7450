use chrono::Utc;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use super::response::{error_response, error_with, ok_json, text};
use super::{RouterContext, RouterState};
use crate::balancer::Algorithm;
use crate::config::load_balancer::validate_weights;
use crate::error::{RouterError, RouterResult};
use crate::registry::{ServiceLookup, ServiceSpec, ServiceType};

const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Outcome of admin routing: a finished response, or the request handed
/// back for the proxy path.
pub(super) enum Routed {
    Handled(Response<Body>),
    Proxy(Request<Body>),
}

#[derive(Debug, Deserialize)]
struct AlgorithmUpdate {
    algorithm: String,
    #[serde(default)]
    weights: Option<HashMap<String, u32>>,
}

pub(super) async fn route(ctx: &RouterContext, req: Request<Body>) -> Routed {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let method = req.method().clone();

    let config = ctx.config();
    if method == Method::GET && path == config.monitoring.endpoint.trim_end_matches('/') {
        return Routed::Handled(metrics(ctx));
    }
    // `/metrics` stays reserved while no exporter is installed
    if method == Method::GET && path == DEFAULT_METRICS_PATH && ctx.prometheus().is_none() {
        return Routed::Handled(metrics(ctx));
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(health(ctx).await),
        (&Method::GET, ["health", "ready"]) => ready(ctx),
        (&Method::GET, ["health", "live"]) => Ok(ok_json(StatusCode::OK, &json!({ "status": "alive" }))),

        (&Method::GET, ["router", "status"]) => Ok(status(ctx).await),
        (&Method::GET, ["router", "config"]) => Ok(ok_json(StatusCode::OK, &ctx.config().redacted())),
        (&Method::POST, ["router", "reload"]) => ctx.reload().await.map(|_| {
            ok_json(StatusCode::ACCEPTED, &json!({ "message": "reload initiated" }))
        }),

        (&Method::GET, ["registry", "services"]) => list_services(ctx, req.uri().query()).await,
        (&Method::POST, ["registry", "services"]) => register(ctx, req).await,
        (&Method::GET, ["registry", "services", id]) => ctx
            .registry
            .get_service(id)
            .await
            .map(|s| ok_json(StatusCode::OK, &s)),
        (&Method::PUT, ["registry", "services", id]) => {
            let id = id.to_string();
            update(ctx, &id, req).await
        }
        (&Method::DELETE, ["registry", "services", id]) => {
            ctx.registry.unregister(id).await.map(|s| {
                info!(service = %s.id, "Service unregistered via admin API");
                ok_json(StatusCode::OK, &s)
            })
        }
        (&Method::GET, ["registry", "services", id, "health"]) => ctx
            .health
            .get_health_status(id)
            .await
            .map(|h| ok_json(StatusCode::OK, &h)),
        (&Method::POST, ["registry", "services", id, "health", "check"]) => ctx
            .health
            .check_health_by_id(id)
            .await
            .map(|h| ok_json(StatusCode::OK, &h)),
        (&Method::GET, ["registry", "health"]) => {
            let summary = ctx.health.get_health_summary().await;
            let services = ctx.health.get_all_health_status().await;
            Ok(ok_json(
                StatusCode::OK,
                &json!({ "summary": summary, "services": services }),
            ))
        }

        (&Method::GET, ["balancer", "algorithm"]) => Ok(ok_json(
            StatusCode::OK,
            &json!({
                "algorithm": ctx.balancer.algorithm().as_str(),
                "available": Algorithm::ALL.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
                "weights": ctx.balancer.weights(),
            }),
        )),
        (&Method::POST, ["balancer", "algorithm"]) => set_algorithm(ctx, req).await,
        (&Method::GET, ["balancer", "metrics"]) => {
            Ok(ok_json(StatusCode::OK, &ctx.balancer.get_metrics()))
        }
        (&Method::POST, ["balancer", "metrics", "reset"]) => {
            ctx.balancer.reset_metrics();
            Ok(ok_json(StatusCode::OK, &json!({ "message": "metrics reset" })))
        }

        (&Method::GET, ["ratelimit", "metrics"]) => {
            Ok(ok_json(StatusCode::OK, &ctx.limiter.metrics()))
        }

        _ => return Routed::Proxy(req),
    };

    Routed::Handled(result.unwrap_or_else(|e| error_response(&e)))
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> RouterResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| RouterError::invalid_request(format!("failed to read body: {}", e)))?;
    if bytes.is_empty() {
        return Err(RouterError::invalid_request("request body is required"));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| RouterError::invalid_request(format!("invalid JSON body: {}", e)))
}

fn metrics(ctx: &RouterContext) -> Response<Body> {
    match ctx.prometheus() {
        Some(handle) => text(StatusCode::OK, crate::metrics::CONTENT_TYPE, handle.render()),
        None => error_with(StatusCode::NOT_FOUND, "NOT_FOUND", "metrics not enabled"),
    }
}

async fn health(ctx: &RouterContext) -> Response<Body> {
    let total = ctx.registry.service_count().await;
    let healthy = ctx.registry.healthy_count().await;
    let checker = if !ctx.health.config().enabled {
        "disabled"
    } else if ctx.health.is_running().await {
        "running"
    } else {
        "stopped"
    };
    let status = if total > 0 && healthy == 0 {
        "degraded"
    } else {
        "healthy"
    };

    ok_json(
        StatusCode::OK,
        &json!({
            "status": status,
            "timestamp": Utc::now(),
            "uptime_seconds": ctx.uptime().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
            "components": {
                "registry": {
                    "status": "healthy",
                    "services": total,
                    "healthy_services": healthy,
                },
                "load_balancer": {
                    "status": "healthy",
                    "algorithm": ctx.balancer.algorithm().as_str(),
                    "active_connections": ctx.balancer.active_connections(),
                },
                "health_checker": {
                    "status": checker,
                    "interval_secs": ctx.health.config().interval,
                },
            },
        }),
    )
}

fn ready(ctx: &RouterContext) -> RouterResult<Response<Body>> {
    match ctx.state() {
        RouterState::Started => Ok(ok_json(StatusCode::OK, &json!({ "status": "ready" }))),
        state => Err(RouterError::service_unavailable(format!(
            "router is {}",
            state
        ))),
    }
}

async fn status(ctx: &RouterContext) -> Response<Body> {
    ok_json(
        StatusCode::OK,
        &json!({
            "state": ctx.state(),
            "started_at": ctx.started_at(),
            "uptime_seconds": ctx.uptime().as_secs(),
            "listen_address": ctx.local_addr().map(|a| a.to_string()),
            "services": {
                "total": ctx.registry.service_count().await,
                "healthy": ctx.registry.healthy_count().await,
            },
            "watchers": ctx.registry.watcher_count().await,
            "algorithm": ctx.balancer.algorithm().as_str(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn list_services(ctx: &RouterContext, query: Option<&str>) -> RouterResult<Response<Body>> {
    let wanted = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "type")
        .map(|(_, v)| v.parse::<ServiceType>())
        .transpose()?;

    let services = match wanted {
        Some(service_type) => ctx.registry.get_services_by_type(service_type).await,
        None => ctx.registry.get_services().await,
    };
    Ok(ok_json(StatusCode::OK, &services))
}

async fn register(ctx: &RouterContext, req: Request<Body>) -> RouterResult<Response<Body>> {
    let spec: ServiceSpec = read_json(req).await?;
    let service = ctx.registry.register(spec.into_service()).await?;
    info!(service = %service.id, address = %service.authority(), "Service registered via admin API");
    Ok(ok_json(StatusCode::CREATED, &service))
}

async fn update(ctx: &RouterContext, id: &str, req: Request<Body>) -> RouterResult<Response<Body>> {
    let mut spec: ServiceSpec = read_json(req).await?;
    if !spec.id.is_empty() && spec.id != id {
        return Err(RouterError::invalid_request(format!(
            "body id '{}' does not match path id '{}'",
            spec.id, id
        )));
    }
    spec.id = id.to_string();
    let service = ctx.registry.update_service(spec.into_service()).await?;
    Ok(ok_json(StatusCode::OK, &service))
}

async fn set_algorithm(ctx: &RouterContext, req: Request<Body>) -> RouterResult<Response<Body>> {
    let update: AlgorithmUpdate = read_json(req).await?;
    // Check everything before touching the balancer so a bad request changes nothing
    update.algorithm.parse::<Algorithm>()?;
    if let Some(weights) = &update.weights {
        validate_weights(weights).map_err(|e| RouterError::invalid_request(e.to_string()))?;
    }

    let algorithm = ctx.balancer.set_algorithm(&update.algorithm)?;
    if let Some(weights) = update.weights {
        ctx.balancer.set_weights(weights)?;
    }
    Ok(ok_json(
        StatusCode::OK,
        &json!({
            "algorithm": algorithm.as_str(),
            "weights": ctx.balancer.weights(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::{HealthReporter, HealthStatus};
    use crate::router::Router;
    use serde_json::Value;

    async fn router() -> Router {
        let mut config = Config::default();
        config.services.health.enabled = false;
        Router::new(config).await.unwrap()
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let req = Request::builder().method(method).uri(uri).body(body).unwrap();
        let response = match route(&router.ctx, req).await {
            Routed::Handled(response) => response,
            Routed::Proxy(_) => panic!("{} was not handled by the admin API", uri),
        };
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_registry_crud() {
        let router = router().await;

        let (status, body) = call(
            &router,
            Method::POST,
            "/registry/services",
            Some(json!({"id": "api-1", "address": "127.0.0.1", "port": 9001, "weight": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["weight"], 3);

        let (status, body) = call(
            &router,
            Method::POST,
            "/registry/services",
            Some(json!({"id": "api-1", "address": "127.0.0.1", "port": 9001})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "ALREADY_EXISTS");

        let (status, body) = call(&router, Method::GET, "/registry/services/api-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["port"], 9001);

        let (status, body) = call(
            &router,
            Method::PUT,
            "/registry/services/api-1",
            Some(json!({"address": "127.0.0.2", "port": 9002})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["address"], "127.0.0.2");

        let (status, body) = call(&router, Method::GET, "/registry/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = call(&router, Method::DELETE, "/registry/services/api-1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&router, Method::DELETE, "/registry/services/api-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_body() {
        let router = router().await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/registry/services")
            .body(Body::from("{not json"))
            .unwrap();
        let Routed::Handled(response) = route(&router.ctx, req).await else {
            panic!("expected admin response");
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_algorithm_switch() {
        let router = router().await;

        let (status, body) = call(
            &router,
            Method::POST,
            "/balancer/algorithm",
            Some(json!({"algorithm": "ip_hash", "weights": {"a": 5}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["algorithm"], "ip_hash");
        assert_eq!(body["data"]["weights"]["a"], 5);

        let (status, body) = call(
            &router,
            Method::POST,
            "/balancer/algorithm",
            Some(json!({"algorithm": "fastest"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_ALGORITHM");

        let (_, body) = call(&router, Method::GET, "/balancer/algorithm", None).await;
        assert_eq!(body["data"]["algorithm"], "ip_hash");
        assert_eq!(body["data"]["available"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_bad_weights_leave_algorithm_unchanged() {
        let router = router().await;
        let (status, _) = call(
            &router,
            Method::POST,
            "/balancer/algorithm",
            Some(json!({"algorithm": "random", "weights": {"a": 0}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(router.load_balancer().algorithm(), Algorithm::RoundRobin);
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let router = router().await;

        let (status, body) = call(&router, Method::GET, "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "alive");

        let (status, _) = call(&router, Method::GET, "/health/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["components"]["health_checker"]["status"], "disabled");
        assert_eq!(body["data"]["components"]["load_balancer"]["algorithm"], "round_robin");
    }

    #[tokio::test]
    async fn test_service_health_views() {
        let router = router().await;
        router
            .registry()
            .register(ServiceSpec::new("a", "127.0.0.1", 9000).into_service())
            .await
            .unwrap();

        let (_, body) = call(&router, Method::GET, "/registry/services/a/health", None).await;
        assert_eq!(body["data"]["status"], "unknown");
        assert_eq!(body["data"]["message"], "No health status available");

        router
            .registry()
            .update_health_status("a", HealthStatus::healthy("Service is healthy"))
            .await
            .unwrap();
        let (_, body) = call(&router, Method::GET, "/registry/health", None).await;
        assert_eq!(body["data"]["summary"]["healthy"], 1);
        assert_eq!(body["data"]["services"]["a"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_status_and_config() {
        let mut config = Config::default();
        config.services.health.enabled = false;
        config.ssl.key_file = Some("/etc/router/key.pem".to_string());
        let router = Router::new(config).await.unwrap();

        let (_, body) = call(&router, Method::GET, "/router/status", None).await;
        assert_eq!(body["data"]["state"], "created");
        assert_eq!(body["data"]["services"]["total"], 0);

        let (_, body) = call(&router, Method::GET, "/router/config", None).await;
        assert_eq!(body["data"]["ssl"]["key_file"], "***");

        let (status, body) = call(&router, Method::POST, "/router/reload", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["message"], "reload initiated");
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let mut config = Config::default();
        config.monitoring.metrics = false;
        config.services.health.enabled = false;
        let router = Router::new(config).await.unwrap();

        let (status, body) = call(&router, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "metrics not enabled");
    }

    #[tokio::test]
    async fn test_metrics_path_reserved_with_custom_endpoint() {
        let mut config = Config::default();
        config.monitoring.enabled = false;
        config.monitoring.endpoint = "/internal/stats".to_string();
        config.services.health.enabled = false;
        let router = Router::new(config).await.unwrap();

        for uri in ["/metrics", "/internal/stats"] {
            let (status, body) = call(&router, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert_eq!(body["error"]["message"], "metrics not enabled");
        }
    }

    #[tokio::test]
    async fn test_unknown_paths_go_to_proxy() {
        let router = router().await;
        let req = Request::builder().uri("/api/orders").body(Body::empty()).unwrap();
        assert!(matches!(route(&router.ctx, req).await, Routed::Proxy(_)));
    }
}
