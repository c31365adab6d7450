use serde::{Deserialize, Serialize};

/// Monitoring and metrics configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub metrics: bool,
    pub tracing: bool,
    /// Path serving the Prometheus exposition
    pub endpoint: String,
    /// Latency histogram buckets in milliseconds
    pub latency_buckets_ms: Vec<f64>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics: true,
            tracing: false,
            endpoint: "/metrics".to_string(),
            latency_buckets_ms: vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
            ],
        }
    }
}

impl MonitoringConfig {
    pub fn metrics_enabled(&self) -> bool {
        self.enabled && self.metrics
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.endpoint.starts_with('/') {
            return Err(anyhow::anyhow!(
                "Monitoring endpoint must start with '/': {}",
                self.endpoint
            ));
        }
        if self.latency_buckets_ms.windows(2).any(|w| w[0] >= w[1]) {
            return Err(anyhow::anyhow!(
                "Monitoring latency buckets must be strictly increasing"
            ));
        }
        Ok(())
    }
}
