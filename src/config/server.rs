use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: u64,     // seconds
    pub write_timeout: u64,    // seconds
    pub idle_timeout: u64,     // seconds
    pub shutdown_timeout: u64, // seconds
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 60,
            shutdown_timeout: 30,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }
        if self.read_timeout == 0 || self.write_timeout == 0 {
            return Err(anyhow::anyhow!(
                "Server read_timeout and write_timeout must be greater than 0"
            ));
        }
        Ok(())
    }

    /// `host:port` string used for binding
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn get_read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn get_write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn get_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn get_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}
