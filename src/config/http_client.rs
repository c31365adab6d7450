use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP client configuration for upstream requests
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: u64, // seconds
    pub connect_timeout: u64,   // seconds
    pub request_timeout: u64,   // seconds
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 32,
            pool_idle_timeout: 90,
            connect_timeout: 10,
            request_timeout: 30,
        }
    }
}

impl HttpClientConfig {
    /// Validate HTTP client configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_max_idle_per_host == 0 {
            return Err(anyhow::anyhow!(
                "HTTP client pool_max_idle_per_host must be greater than 0"
            ));
        }
        if self.connect_timeout == 0 {
            return Err(anyhow::anyhow!(
                "HTTP client connect_timeout must be greater than 0"
            ));
        }
        if self.request_timeout == 0 {
            return Err(anyhow::anyhow!(
                "HTTP client request_timeout must be greater than 0"
            ));
        }
        Ok(())
    }

    pub fn get_pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout)
    }

    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn get_request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}
