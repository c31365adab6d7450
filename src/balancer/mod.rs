//! # 负载均衡器模块
//!
//! 在健康的候选服务中为每个请求选择一个目标，算法可在运行时原子替换。
//!
//! ## 负载均衡算法
//!
//! - **轮询 (Round Robin)**: 按注册顺序依次分配
//! - **加权轮询 (Weighted Round Robin)**: 平滑加权，每个服务在一个周期内出现 `weight` 次
//! - **最少连接 (Least Connections)**: 选择进行中请求最少的服务
//! - **IP哈希 (IP Hash)**: 相同客户端地址固定映射到同一服务
//! - **随机 (Random)**: 均匀随机选择
//!
//! ## 使用示例
//!
//! ```rust,no_run
//! use service_router::balancer::LoadBalancer;
//! use service_router::config::LoadBalancerConfig;
//!
//! # fn example(candidates: Vec<service_router::registry::Service>) -> service_router::RouterResult<()> {
//! let balancer = LoadBalancer::new(&LoadBalancerConfig::default())?;
//! let target = balancer.select_for_client(None, &candidates)?;
//! println!("选择的目标: {}", target.authority());
//! # Ok(())
//! # }
//! ```

pub mod algorithms; // 负载均衡算法实现
pub mod load_balancer; // 负载均衡器
pub mod metrics; // 指标收集和统计
pub mod state; // 进行中连接计数

pub use algorithms::{Algorithm, BalancingAlgorithm};
pub use load_balancer::{client_ip, peer_addr, LoadBalancer};
pub use metrics::BalancerMetrics;
pub use state::ConnectionGuard;
