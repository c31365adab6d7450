//! Periodic HTTP health probing of registered services.

mod checker;

pub use checker::{probe_url, HealthChecker, HealthSummary};
