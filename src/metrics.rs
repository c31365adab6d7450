//! Prometheus exposition for the `metrics` facade.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::MonitoringConfig;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const DURATION_HISTOGRAMS: &[&str] = &[
    "router_request_duration_ms",
    "router_health_check_duration_ms",
];

// A process holds at most one global recorder
static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the recorder on first use and return its handle, or `None`
/// when metrics are disabled.
pub fn install(config: &MonitoringConfig) -> Option<PrometheusHandle> {
    if !config.metrics_enabled() {
        debug!("Metrics disabled, recorder not installed");
        return None;
    }
    let handle = PROMETHEUS.get_or_init(|| {
        let builder = with_buckets(&config.latency_buckets_ms);
        match builder.install_recorder() {
            Ok(handle) => {
                describe();
                info!("Prometheus recorder installed");
                handle
            }
            Err(e) => {
                // Another recorder owns the facade; keep a local one so the endpoint still renders
                debug!("Prometheus recorder install skipped: {}", e);
                with_buckets(&config.latency_buckets_ms)
                    .build_recorder()
                    .handle()
            }
        }
    });
    Some(handle.clone())
}

fn with_buckets(buckets: &[f64]) -> PrometheusBuilder {
    let mut res: Result<PrometheusBuilder, metrics_exporter_prometheus::BuildError> =
        Ok(PrometheusBuilder::new());
    for name in DURATION_HISTOGRAMS {
        res = res.and_then(|b| b.set_buckets_for_metric(Matcher::Full(name.to_string()), buckets));
    }
    match res {
        Ok(b) => b,
        Err(e) => {
            debug!("Failed to apply histogram buckets: {} (using defaults)", e);
            PrometheusBuilder::new()
        }
    }
}

fn describe() {
    metrics::describe_counter!("router_requests_total", "Requests handled, by status code");
    metrics::describe_histogram!(
        "router_request_duration_ms",
        metrics::Unit::Milliseconds,
        "End-to-end request latency"
    );
    metrics::describe_counter!(
        "router_balancer_selections_total",
        "Backend selections, by algorithm and service"
    );
    metrics::describe_counter!("router_health_checks_total", "Health probes, by outcome");
    metrics::describe_histogram!(
        "router_health_check_duration_ms",
        metrics::Unit::Milliseconds,
        "Health probe latency"
    );
    metrics::describe_counter!("router_rate_limit_denied_total", "Requests refused admission");
    metrics::describe_gauge!("router_registry_services", "Registered services");
}

/// Record one finished request
pub fn record_request(status: u16, elapsed: Duration) {
    metrics::counter!("router_requests_total", "status" => status.to_string()).increment(1);
    metrics::histogram!("router_request_duration_ms").record(elapsed.as_secs_f64() * 1000.0);
}
