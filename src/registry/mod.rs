//! Service registry: the authoritative table of backend instances.
//!
//! All state sits behind one reader-writer lock. Mutations hold the write
//! lock while they publish their event, so watchers see events in commit
//! order.

mod events;
mod model;
mod service_registry;
pub mod storage;

pub use events::WATCH_QUEUE_CAPACITY;
pub use model::{
    EventType, HealthState, HealthStatus, RegistryEvent, Service, ServiceSpec, ServiceType,
};
pub use service_registry::ServiceRegistry;
pub use storage::{MemoryStorage, Storage};

use async_trait::async_trait;

use crate::error::RouterResult;

/// Read access to registered services
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    async fn get_service(&self, id: &str) -> RouterResult<Service>;
    async fn get_services(&self) -> Vec<Service>;
}

/// The single write path for health results
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn update_health_status(&self, id: &str, status: HealthStatus) -> RouterResult<()>;
}

/// What a health checker needs from a registry, nothing more
pub trait HealthTarget: ServiceLookup + HealthReporter {}

impl<T: ServiceLookup + HealthReporter + ?Sized> HealthTarget for T {}
