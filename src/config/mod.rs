//! # 配置管理模块
//!
//! 服务路由器的配置加载、校验与脱敏：
//!
//! - TOML 配置文件解析，所有字段均有默认值
//! - `${VAR}` / `${VAR:-default}` 环境变量展开
//! - `ROUTER_*` 环境变量覆盖
//! - 管理接口使用的脱敏视图
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use service_router::config::Config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file_with_env("config/router.toml").await?;
//! println!("监听地址: {}", config.server.address());
//! # Ok(())
//! # }
//! ```

pub mod http_client; // 上游HTTP客户端配置
pub mod load_balancer; // 负载均衡配置
pub mod logging; // 日志配置
pub mod monitoring; // 监控配置
pub mod security; // 限流、CORS、认证配置
pub mod server; // 监听器配置
pub mod services; // 服务发现、健康检查、注册表配置
pub mod ssl; // TLS配置
pub mod storage; // 持久化配置

pub use http_client::HttpClientConfig;
pub use load_balancer::LoadBalancerConfig;
pub use logging::{LogFormat, LogOutput, LoggingConfig};
pub use monitoring::MonitoringConfig;
pub use security::{
    AuthConfig, CorsConfig, FirewallConfig, FirewallRule, RateLimitConfig, RateLimitRule,
    SecurityConfig,
};
pub use server::ServerConfig;
pub use services::{DiscoveryConfig, HealthCheckConfig, RegistryConfig, ServicesConfig};
pub use ssl::SslConfig;
pub use storage::StorageConfig;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::Path;
use tracing::{info, warn};

const REDACTED: &str = "***";
const SECRET_MARKERS: &[&str] = &["secret", "password", "token", "key"];

/// Main router configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub load_balancer: LoadBalancerConfig,
    pub security: SecurityConfig,
    pub ssl: SslConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub http_client: HttpClientConfig,
}

impl Config {
    /// Load configuration from file with environment variable expansion
    pub async fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;

        let config = Self::parse_with_env(&content)?;
        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Parse a TOML document, expanding `${VAR}` placeholders and applying
    /// `ROUTER_*` overrides from the process environment
    pub fn parse_with_env(content: &str) -> Result<Self> {
        let expanded_content = expand_env_vars(content);
        let mut config: Config = toml::from_str(&expanded_content)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROUTER_*` overrides from the given lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| -> Result<Option<bool>> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<bool>()
                    .map(Some)
                    .with_context(|| format!("{} must be true or false, got '{}'", key, v)),
                None => Ok(None),
            }
        };

        if let Some(host) = lookup("ROUTER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("ROUTER_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("ROUTER_PORT is not a valid port: '{}'", port))?;
        }
        if let Some(algorithm) = lookup("ROUTER_ALGORITHM") {
            self.load_balancer.algorithm = algorithm;
        }
        if let Some(enabled) = flag("ROUTER_RATE_LIMIT")? {
            self.security.rate_limit.enabled = enabled;
        }
        if let Some(enabled) = flag("ROUTER_CORS")? {
            self.security.cors.enabled = enabled;
        }
        if let Some(enabled) = flag("ROUTER_MONITORING")? {
            self.monitoring.enabled = enabled;
        }
        if let Some(level) = lookup("ROUTER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("ROUTER_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format)
                .with_context(|| format!("ROUTER_LOG_FORMAT must be json or text, got '{}'", format))?;
        }
        if let Some(enabled) = flag("ROUTER_SSL_ENABLED")? {
            self.ssl.enabled = enabled;
        }
        if let Some(cert) = lookup("ROUTER_CERT_FILE") {
            self.ssl.cert_file = Some(cert);
        }
        if let Some(key) = lookup("ROUTER_KEY_FILE") {
            self.ssl.key_file = Some(key);
        }
        if let Some(storage) = lookup("ROUTER_STORAGE") {
            self.storage.storage_type = storage;
        }
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            warn!("Server port is 0, an ephemeral port will be chosen");
        }
        self.server.validate()?;
        self.services.validate()?;
        self.load_balancer.validate()?;
        self.security.validate()?;
        self.ssl.validate()?;
        self.monitoring.validate()?;
        self.logging.validate()?;
        self.storage.validate()?;
        self.http_client.validate()?;
        Ok(())
    }

    /// JSON view of the configuration with secrets masked
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);

        if let Some(options) = value
            .pointer_mut("/security/auth/options")
            .and_then(Value::as_object_mut)
        {
            for v in options.values_mut() {
                *v = Value::String(REDACTED.to_string());
            }
        }
        if let Some(key_file) = value.pointer_mut("/ssl/key_file") {
            if !key_file.is_null() {
                *key_file = Value::String(REDACTED.to_string());
            }
        }
        for pointer in [
            "/services/discovery/options",
            "/services/registry/options",
            "/storage/options",
        ] {
            if let Some(options) = value.pointer_mut(pointer).and_then(Value::as_object_mut) {
                for (k, v) in options.iter_mut() {
                    let lower = k.to_ascii_lowercase();
                    if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
                        *v = Value::String(REDACTED.to_string());
                    }
                }
            }
        }
        value
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let mut cursor = 0;

    while let Some(offset) = result[cursor..].find("${") {
        let start = cursor + offset;
        let Some(end) = result[start..].find('}') else {
            break; // Malformed ${VAR expression
        };
        let var_expr = &result[start + 2..start + end];
        let replacement = if let Some(default_pos) = var_expr.find(":-") {
            let var_name = &var_expr[..default_pos];
            let default_value = &var_expr[default_pos + 2..];
            env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        } else {
            env::var(var_expr).unwrap_or_else(|_| {
                warn!(
                    "Environment variable '{}' not found, using empty string",
                    var_expr
                );
                String::new()
            })
        };

        result.replace_range(start..start + end + 1, &replacement);
        cursor = start + replacement.len();
    }

    result
}
