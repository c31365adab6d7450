//! # Service Router - 服务注册、健康感知负载均衡与反向代理
//!
//! Service Router 是一个用Rust编写的单集群服务路由器。它维护动态注册的后端实例表，
//! 持续探测实例健康状态，按可替换的算法选择目标实例并转发请求。
//!
//! ## 核心功能
//!
//! - **服务注册表**: 注册、注销、更新与事件订阅（至多一次投递）
//! - **健康检查**: 有并发上限的周期性HTTP探测
//! - **负载均衡**: 轮询、加权轮询、最少连接、IP哈希、随机
//! - **限流**: 按客户端与路由规则的固定窗口准入控制
//! - **反向代理**: HTTP/HTTPS转发与WebSocket双向中继
//! - **管理接口**: 注册表、负载均衡、健康、指标与路由器状态
//! - **优雅关闭**: 截止时间内等待进行中的请求
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use service_router::{config::Config, Router};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file_with_env("config/router.toml").await?;
//!     let router = Router::new(config).await?;
//!     let addr = router.start().await?;
//!     println!("listening on {}", addr);
//!     tokio::signal::ctrl_c().await?;
//!     router.stop(Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod tls;

// Re-export commonly used types
pub use balancer::{Algorithm, LoadBalancer};
pub use config::Config;
pub use error::{ErrorSeverity, RouterError, RouterResult};
pub use health::{HealthChecker, HealthSummary};
pub use proxy::ReverseProxy;
pub use ratelimit::{RateLimiter, Reservation};
pub use registry::{
    EventType, HealthState, HealthStatus, RegistryEvent, Service, ServiceRegistry, ServiceSpec,
    ServiceType,
};
pub use router::{Router, RouterState};
