//! # 反向代理模块
//!
//! 将请求转发到选定的上游服务并回传响应：
//!
//! - 共享连接池的上游 HTTP/HTTPS 客户端
//! - 逐跳头部剥离与 `X-Forwarded-*` 头部注入
//! - WebSocket 升级后的双向字节流中继

pub mod forward; // 单次请求转发
pub mod http_client; // 上游客户端与头部工具
pub mod websocket; // WebSocket 升级中继

pub use forward::ReverseProxy;
pub use http_client::{build_client, UpstreamClient};
pub use websocket::is_websocket_upgrade;
