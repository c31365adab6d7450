use hyper::{Body, Client, Request, StatusCode};
use serde_json::Value;
use service_router::registry::{MemoryStorage, ServiceLookup, ServiceSpec};
use service_router::{Algorithm, Config, Router, ServiceRegistry};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const BASE_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 0

[services.health]
enabled = false

[services.discovery]
type = "static"

[[services.discovery.services]]
id = "api-1"
address = "10.0.0.1"
port = 8080
weight = 2

[load_balancer]
algorithm = "round_robin"

[monitoring]
enabled = false
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn test_router_from_config_file() {
    let file = write_config(BASE_CONFIG);
    let router = Router::from_config_file(file.path()).await.unwrap();

    let config = router.config();
    assert_eq!(config.server.host, "127.0.0.1");
    assert!(!config.services.health.enabled);
    assert_eq!(router.load_balancer().algorithm(), Algorithm::RoundRobin);

    let service = router.registry().get_service("api-1").await.unwrap();
    assert_eq!(service.weight, 2);
    assert_eq!(service.authority(), "10.0.0.1:8080");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let file = write_config(
        r#"
[load_balancer]
algorithm = "fastest"
"#,
    );
    assert!(Router::from_config_file(file.path()).await.is_err());

    let file = write_config(
        r#"
[load_balancer.weights]
api-1 = 500
"#,
    );
    assert!(Router::from_config_file(file.path()).await.is_err());

    assert!(Router::from_config_file("/nonexistent/router.toml").await.is_err());
}

#[tokio::test]
async fn test_env_placeholders_and_overrides() {
    std::env::set_var("SERVICE_ROUTER_TEST_UPSTREAM", "10.9.9.9");
    let config = Config::parse_with_env(
        r#"
[[services.discovery.services]]
id = "from-env"
address = "${SERVICE_ROUTER_TEST_UPSTREAM}"
port = 80
"#,
    )
    .unwrap();
    assert_eq!(config.services.discovery.services[0].address, "10.9.9.9");

    let mut config = Config::default();
    config
        .apply_overrides(|key| match key {
            "ROUTER_PORT" => Some("9000".to_string()),
            "ROUTER_ALGORITHM" => Some("ip_hash".to_string()),
            "ROUTER_RATE_LIMIT" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.load_balancer.algorithm, "ip_hash");
    assert!(config.security.rate_limit.enabled);

    let mut config = Config::default();
    let err = config.apply_overrides(|key| (key == "ROUTER_PORT").then(|| "http".to_string()));
    assert!(err.is_err());
}

#[tokio::test]
async fn test_reload_applies_file_changes() {
    let file = write_config(BASE_CONFIG);
    let router = Router::from_config_file(file.path()).await.unwrap();
    let addr = router.start().await.unwrap();

    let updated = BASE_CONFIG
        .replace(
            r#"algorithm = "round_robin""#,
            r#"algorithm = "least_connections""#,
        )
        + r#"
[[services.discovery.services]]
id = "api-2"
address = "10.0.0.2"
port = 8080
"#;
    // Rewrite in place; the router remembers the path
    std::fs::write(file.path(), updated).unwrap();

    let req = Request::post(format!("http://{}/router/reload", addr))
        .body(Body::empty())
        .unwrap();
    let response = Client::new().request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["data"]["message"], "reload initiated");

    assert_eq!(router.load_balancer().algorithm(), Algorithm::LeastConnections);
    assert_eq!(router.registry().service_count().await, 2);
    assert_eq!(router.config().load_balancer.algorithm, "least_connections");

    router.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_failed_reload_keeps_running_config() {
    let file = write_config(BASE_CONFIG);
    let router = Router::from_config_file(file.path()).await.unwrap();
    let addr = router.start().await.unwrap();

    std::fs::write(file.path(), "[load_balancer]\nalgorithm = \"fastest\"\n").unwrap();

    let req = Request::post(format!("http://{}/router/reload", addr))
        .body(Body::empty())
        .unwrap();
    let response = Client::new().request(req).await.unwrap();
    assert!(!response.status().is_success());

    assert_eq!(router.load_balancer().algorithm(), Algorithm::RoundRobin);
    assert_eq!(router.config().load_balancer.algorithm, "round_robin");

    router.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_reload_with_bad_static_service_changes_nothing() {
    let file = write_config(BASE_CONFIG);
    let router = Router::from_config_file(file.path()).await.unwrap();
    let addr = router.start().await.unwrap();

    let updated = BASE_CONFIG.replace(
        r#"algorithm = "round_robin""#,
        r#"algorithm = "ip_hash""#,
    ) + r#"
[[services.discovery.services]]
id = "bad"
address = "10.0.0.9"
port = 0
"#;
    std::fs::write(file.path(), updated).unwrap();

    let req = Request::post(format!("http://{}/router/reload", addr))
        .body(Body::empty())
        .unwrap();
    let response = Client::new().request(req).await.unwrap();
    assert!(!response.status().is_success());

    assert_eq!(router.load_balancer().algorithm(), Algorithm::RoundRobin);
    assert_eq!(router.config().load_balancer.algorithm, "round_robin");
    assert_eq!(router.registry().service_count().await, 1);
    assert!(router.registry().get_service("bad").await.is_err());

    router.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_router_restores_registrations_from_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let earlier = ServiceRegistry::with_storage(storage.clone());
    earlier
        .register(ServiceSpec::new("dynamic-1", "10.0.0.5", 9000).into_service())
        .await
        .unwrap();
    earlier
        .register(ServiceSpec::new("api-1", "10.0.0.99", 1).into_service())
        .await
        .unwrap();

    let config = Config::parse_with_env(BASE_CONFIG).unwrap();
    let router = Router::with_storage(config, storage.clone()).await.unwrap();

    let restored = router.registry().get_service("dynamic-1").await.unwrap();
    assert_eq!(restored.authority(), "10.0.0.5:9000");
    // Static configuration wins over a stale stored record
    let configured = router.registry().get_service("api-1").await.unwrap();
    assert_eq!(configured.authority(), "10.0.0.1:8080");
    assert_eq!(router.registry().service_count().await, 2);

    // New registrations land in the same store
    router
        .registry()
        .register(ServiceSpec::new("dynamic-2", "10.0.0.6", 9000).into_service())
        .await
        .unwrap();
    let next = ServiceRegistry::with_storage(storage);
    assert_eq!(next.load_from_storage().await.unwrap(), 3);
}
