use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::registry::ServiceSpec;

/// Service discovery, health checking and registry settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub discovery: DiscoveryConfig,
    pub health: HealthCheckConfig,
    pub registry: RegistryConfig,
}

/// Discovery source. Only `static` is built in: the listed services are
/// registered when the router is constructed and again on reload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(rename = "type")]
    pub discovery_type: String,
    pub interval: u64, // seconds
    pub options: HashMap<String, String>,
    pub services: Vec<ServiceSpec>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_type: "static".to_string(),
            interval: 30,
            options: HashMap::new(),
            services: Vec::new(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: u64, // seconds
    pub timeout: u64,  // seconds
    pub path: String,
    pub max_concurrent: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 30,
            timeout: 5,
            path: "/health".to_string(),
            max_concurrent: 10,
        }
    }
}

impl HealthCheckConfig {
    /// Get the interval as Duration
    pub fn get_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Get the timeout as Duration
    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(rename = "type")]
    pub registry_type: String,
    pub options: HashMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: "memory".to_string(),
            options: HashMap::new(),
        }
    }
}

impl ServicesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.discovery.discovery_type != "static" {
            return Err(anyhow::anyhow!(
                "Unsupported discovery type: {}",
                self.discovery.discovery_type
            ));
        }
        if self.registry.registry_type != "memory" {
            return Err(anyhow::anyhow!(
                "Unsupported registry type: {}",
                self.registry.registry_type
            ));
        }

        let health = &self.health;
        if health.enabled {
            if health.interval == 0 || health.timeout == 0 {
                return Err(anyhow::anyhow!(
                    "Health check interval and timeout must be greater than 0"
                ));
            }
            if health.timeout > health.interval {
                return Err(anyhow::anyhow!(
                    "Health check timeout ({}s) cannot exceed interval ({}s)",
                    health.timeout,
                    health.interval
                ));
            }
            if health.max_concurrent == 0 {
                return Err(anyhow::anyhow!(
                    "Health check max_concurrent must be greater than 0"
                ));
            }
            if !health.path.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "Health check path must start with '/': {}",
                    health.path
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.discovery.services {
            if spec.id.trim().is_empty() {
                return Err(anyhow::anyhow!("Static service with empty id"));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate static service id: {}", spec.id));
            }
            spec.clone()
                .into_service()
                .validate()
                .map_err(|e| anyhow::anyhow!("Invalid static service '{}': {}", spec.id, e))?;
        }
        Ok(())
    }
}
