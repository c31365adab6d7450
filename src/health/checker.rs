use chrono::{DateTime, Utc};
use hyper::{header, Body, Method, Request, Uri};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::error::{RouterError, RouterResult};
use crate::proxy::UpstreamClient;
use crate::registry::{HealthState, HealthStatus, HealthTarget, Service};

const USER_AGENT: &str = concat!("service-router-health/", env!("CARGO_PKG_VERSION"));

/// Counts by health state
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub checked_at: DateTime<Utc>,
}

/// Probe URL for a service. The port is rendered as decimal text and left
/// out only when it is the default for the scheme.
pub fn probe_url(service: &Service, path: &str) -> String {
    let scheme = service.scheme();
    let default_port = matches!((scheme, service.port), ("http", 80) | ("https", 443));
    let authority = if default_port {
        if service.address.contains(':') && !service.address.starts_with('[') {
            format!("[{}]", service.address)
        } else {
            service.address.clone()
        }
    } else {
        service.authority()
    };

    if path.starts_with('/') {
        format!("{}://{}{}", scheme, authority, path)
    } else {
        format!("{}://{}/{}", scheme, authority, path)
    }
}

/// Everything one probe cycle needs; cheap to clone into tasks
#[derive(Clone)]
struct Prober {
    target: Arc<dyn HealthTarget>,
    client: UpstreamClient,
    config: HealthCheckConfig,
    semaphore: Arc<Semaphore>,
}

impl Prober {
    async fn probe(&self, service: &Service) -> HealthStatus {
        let url = probe_url(service, &self.config.path);
        let timeout = self.config.get_timeout();
        let start = Instant::now();

        let request = url
            .parse::<Uri>()
            .map_err(|e| e.to_string())
            .and_then(|uri| {
                Request::builder()
                    .method(Method::GET)
                    .uri(uri)
                    .header(header::USER_AGENT, USER_AGENT)
                    .body(Body::empty())
                    .map_err(|e| e.to_string())
            });

        let status = match request {
            Err(e) => HealthStatus::unhealthy("Failed to create health check request")
                .with_detail("error", e),
            Ok(request) => {
                match tokio::time::timeout(timeout, self.client.request(request)).await {
                    Ok(Ok(response)) => {
                        let code = response.status();
                        let status = if code.is_success() {
                            HealthStatus::healthy("Service is healthy")
                        } else {
                            HealthStatus::unhealthy("Service returned error status")
                        };
                        status.with_detail("status_code", code.as_u16())
                    }
                    Ok(Err(e)) => HealthStatus::unhealthy("Health check request failed")
                        .with_detail("error", e.to_string()),
                    Err(_) => HealthStatus::unhealthy("Health check timed out")
                        .with_detail("error", format!("no response within {:?}", timeout)),
                }
            }
        };

        let elapsed = start.elapsed();
        metrics::counter!("router_health_checks_total", "state" => status.status.as_str())
            .increment(1);
        metrics::histogram!("router_health_check_duration_ms").record(elapsed.as_secs_f64() * 1000.0);

        status.with_duration(elapsed).with_detail("url", url)
    }

    /// Probe and write the result back through the registry contract
    async fn check(&self, service: &Service) -> HealthStatus {
        let status = self.probe(service).await;
        debug!(
            service = %service.id,
            state = %status.status,
            duration_ms = status.duration_ms,
            "Health check completed"
        );

        match self
            .target
            .update_health_status(&service.id, status.clone())
            .await
        {
            Ok(()) => {}
            Err(RouterError::NotFound { .. }) => {
                debug!(service = %service.id, "Service unregistered during health check");
            }
            Err(e) => warn!(service = %service.id, error = %e, "Failed to record health status"),
        }
        status
    }

    /// One cycle: probe every service, at most `max_concurrent` at a time
    async fn check_all(&self) {
        let services = self.target.get_services().await;
        if services.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for service in services {
            let prober = self.clone();
            tasks.spawn(async move {
                let Ok(_permit) = prober.semaphore.clone().acquire_owned().await else {
                    return HealthState::Unknown;
                };
                prober.check(&service).await.status
            });
        }

        let (mut healthy, mut unhealthy) = (0usize, 0usize);
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(HealthState::Healthy) => healthy += 1,
                Ok(_) => unhealthy += 1,
                Err(e) => warn!(error = %e, "Health check task failed"),
            }
        }
        debug!(healthy, unhealthy, "Health check cycle finished");
    }
}

struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic prober that reports into a registry.
///
/// It depends only on [`HealthTarget`]: reads to enumerate services and
/// `update_health_status` to record results.
pub struct HealthChecker {
    prober: Prober,
    scheduler: Mutex<Option<Scheduler>>,
}

impl HealthChecker {
    pub fn new(
        target: Arc<dyn HealthTarget>,
        client: UpstreamClient,
        config: HealthCheckConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            prober: Prober {
                target,
                client,
                config,
                semaphore,
            },
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.prober.config
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Start the periodic scan. The scheduler stops when `parent` is
    /// cancelled or on [`stop_health_checks`](Self::stop_health_checks).
    /// Disabled checking is logged and treated as success.
    pub async fn start_health_checks(&self, parent: &CancellationToken) -> RouterResult<()> {
        if !self.prober.config.enabled {
            info!("Health checks disabled by configuration");
            return Ok(());
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return Err(RouterError::already_running("health checker"));
        }

        let token = parent.child_token();
        let prober = self.prober.clone();
        let interval = prober.config.get_interval();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => prober.check_all().await,
                }
            }
            debug!("Health check scheduler exited");
        });

        info!(
            interval_secs = interval.as_secs(),
            path = %self.prober.config.path,
            max_concurrent = self.prober.config.max_concurrent,
            "Health checks started"
        );
        *scheduler = Some(Scheduler { token, handle });
        Ok(())
    }

    /// Cancel the scheduler and wait for the current probe batch. No-op
    /// when not running.
    pub async fn stop_health_checks(&self) {
        let Some(scheduler) = self.scheduler.lock().await.take() else {
            return;
        };
        scheduler.token.cancel();
        if let Err(e) = scheduler.handle.await {
            warn!(error = %e, "Health check scheduler ended abnormally");
        }
        info!("Health checks stopped");
    }

    /// Probe one service now and record the result
    pub async fn check_health(&self, service: &Service) -> HealthStatus {
        self.prober.check(service).await
    }

    pub async fn check_health_by_id(&self, id: &str) -> RouterResult<HealthStatus> {
        let service = self.prober.target.get_service(id).await?;
        Ok(self.check_health(&service).await)
    }

    pub async fn get_health_status(&self, id: &str) -> RouterResult<HealthStatus> {
        let service = self.prober.target.get_service(id).await?;
        Ok(service
            .health
            .unwrap_or_else(|| HealthStatus::unknown("No health status available")))
    }

    pub async fn get_all_health_status(&self) -> BTreeMap<String, HealthStatus> {
        self.prober
            .target
            .get_services()
            .await
            .into_iter()
            .map(|s| {
                let status = s
                    .health
                    .unwrap_or_else(|| HealthStatus::unknown("No health status available"));
                (s.id, status)
            })
            .collect()
    }

    async fn services_in(&self, state: HealthState) -> Vec<Service> {
        self.prober
            .target
            .get_services()
            .await
            .into_iter()
            .filter(|s| s.health_state() == state)
            .collect()
    }

    pub async fn get_healthy_services(&self) -> Vec<Service> {
        self.services_in(HealthState::Healthy).await
    }

    pub async fn get_unhealthy_services(&self) -> Vec<Service> {
        self.services_in(HealthState::Unhealthy).await
    }

    pub async fn get_unknown_services(&self) -> Vec<Service> {
        self.services_in(HealthState::Unknown).await
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        let services = self.prober.target.get_services().await;
        let mut summary = HealthSummary {
            total: services.len(),
            healthy: 0,
            unhealthy: 0,
            unknown: 0,
            checked_at: Utc::now(),
        };
        for service in &services {
            match service.health_state() {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Unhealthy => summary.unhealthy += 1,
                HealthState::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientConfig;
    use crate::proxy::build_client;
    use crate::registry::{ServiceRegistry, ServiceSpec, ServiceType};

    fn service(address: &str, port: u16) -> Service {
        ServiceSpec::new("svc", address, port).into_service()
    }

    #[test]
    fn test_probe_url_formats_port_as_decimal() {
        assert_eq!(
            probe_url(&service("host", 8080), "/health"),
            "http://host:8080/health"
        );
        assert_eq!(
            probe_url(&service("10.0.0.7", 65535), "status"),
            "http://10.0.0.7:65535/status"
        );
    }

    #[test]
    fn test_probe_url_default_ports_and_scheme() {
        assert_eq!(probe_url(&service("host", 80), "/health"), "http://host/health");

        let mut https = ServiceSpec::new("s", "secure", 443)
            .with_type(ServiceType::Https)
            .into_service();
        assert_eq!(probe_url(&https, "/health"), "https://secure/health");

        https.port = 80;
        assert_eq!(probe_url(&https, "/health"), "https://secure:80/health");

        assert_eq!(probe_url(&service("::1", 80), "/h"), "http://[::1]/h");
        assert_eq!(probe_url(&service("::1", 9000), "/h"), "http://[::1]:9000/h");
    }

    #[tokio::test]
    async fn test_malformed_url_is_unhealthy() {
        let registry = Arc::new(ServiceRegistry::new());
        let checker = HealthChecker::new(
            registry.clone(),
            build_client(&HttpClientConfig::default()),
            HealthCheckConfig::default(),
        );

        let bad = service("bad host name", 8080);
        registry.register(bad.clone()).await.unwrap();
        let status = checker.check_health(&bad).await;

        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.message, "Failed to create health check request");
        assert!(status.details.contains_key("error"));
        assert!(!registry.get_healthy_services().await.iter().any(|s| s.id == "svc"));
    }

    #[tokio::test]
    async fn test_disabled_start_is_noop() {
        let registry = Arc::new(ServiceRegistry::new());
        let config = HealthCheckConfig {
            enabled: false,
            ..Default::default()
        };
        let checker = HealthChecker::new(
            registry,
            build_client(&HttpClientConfig::default()),
            config,
        );

        let token = CancellationToken::new();
        checker.start_health_checks(&token).await.unwrap();
        assert!(!checker.is_running().await);
        checker.stop_health_checks().await;
    }

    #[tokio::test]
    async fn test_unknown_status_for_unprobed_service() {
        let registry = Arc::new(ServiceRegistry::new());
        let checker = HealthChecker::new(
            registry.clone(),
            build_client(&HttpClientConfig::default()),
            HealthCheckConfig::default(),
        );
        registry.register(service("127.0.0.1", 1)).await.unwrap();

        let status = checker.get_health_status("svc").await.unwrap();
        assert_eq!(status.status, HealthState::Unknown);
        assert_eq!(status.message, "No health status available");
        assert_eq!(checker.get_unknown_services().await.len(), 1);

        let summary = checker.get_health_summary().await;
        assert_eq!((summary.total, summary.unknown), (1, 1));
    }
}
