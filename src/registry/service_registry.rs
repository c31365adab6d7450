use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::Watchers;
use super::model::{EventType, HealthStatus, RegistryEvent, Service, ServiceType};
use super::storage::Storage;
use super::{HealthReporter, ServiceLookup};
use crate::error::{RouterError, RouterResult};

const STORAGE_PREFIX: &str = "service:";

#[derive(Default)]
struct RegistryState {
    // Insertion order is registration order
    services: IndexMap<String, Service>,
    watchers: Watchers,
}

impl RegistryState {
    fn emit(&mut self, event_type: EventType, service: &Service) {
        let event = RegistryEvent::new(event_type, service.clone());
        let delivered = self.watchers.publish(&event);
        debug!(
            event = ?event_type,
            service = %service.id,
            delivered,
            "Registry event published"
        );
    }
}

/// In-memory service registry with optional write-through persistence
#[derive(Clone)]
pub struct ServiceRegistry {
    state: Arc<RwLock<RegistryState>>,
    storage: Option<Arc<dyn Storage>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    /// Memory-only registry
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            storage: Some(storage),
        }
    }

    /// Restore services persisted by an earlier instance. Records that fail
    /// to decode are skipped. Returns the number of services loaded.
    pub async fn load_from_storage(&self) -> RouterResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };

        let keys = storage.keys(STORAGE_PREFIX).await?;
        let mut state = self.state.write().await;
        let mut loaded = 0;
        for key in keys {
            let Some(raw) = storage.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<Service>(&raw) {
                Ok(service) if !state.services.contains_key(&service.id) => {
                    state.services.insert(service.id.clone(), service);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping undecodable service record"),
            }
        }
        metrics::gauge!("router_registry_services").set(state.services.len() as f64);
        info!(loaded, "Registry restored from storage");
        Ok(loaded)
    }

    /// Add a new service. Fails if the id is empty or already registered.
    pub async fn register(&self, mut service: Service) -> RouterResult<Service> {
        service.validate()?;

        let mut state = self.state.write().await;
        if state.services.contains_key(&service.id) {
            return Err(RouterError::already_exists(&service.id));
        }

        let now = Utc::now();
        service.created_at = now;
        service.updated_at = now;
        service.last_seen = now;

        self.persist(&service).await;
        state.services.insert(service.id.clone(), service.clone());
        state.emit(EventType::Register, &service);
        metrics::gauge!("router_registry_services").set(state.services.len() as f64);

        info!(
            service = %service.id,
            address = %service.authority(),
            "Service registered"
        );
        Ok(service)
    }

    pub async fn unregister(&self, id: &str) -> RouterResult<Service> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .shift_remove(id)
            .ok_or_else(|| RouterError::service_not_found(id))?;

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete(&storage_key(id)).await {
                warn!(service = %id, error = %e, "Failed to delete persisted service");
            }
        }
        state.emit(EventType::Unregister, &service);
        metrics::gauge!("router_registry_services").set(state.services.len() as f64);

        info!(service = %id, "Service unregistered");
        Ok(service)
    }

    /// Replace a service record, keeping its creation time and, when the
    /// update carries none, its last health status
    pub async fn update_service(&self, mut service: Service) -> RouterResult<Service> {
        service.validate()?;

        let mut state = self.state.write().await;
        let existing = state
            .services
            .get_mut(&service.id)
            .ok_or_else(|| RouterError::service_not_found(&service.id))?;

        let now = Utc::now();
        service.created_at = existing.created_at;
        service.updated_at = now.max(existing.created_at);
        service.last_seen = now.max(existing.last_seen);
        if service.health.is_none() {
            service.health = existing.health.clone();
        }
        *existing = service.clone();

        self.persist(&service).await;
        state.emit(EventType::Update, &service);

        debug!(service = %service.id, "Service updated");
        Ok(service)
    }

    pub async fn get_services_by_type(&self, service_type: ServiceType) -> Vec<Service> {
        let state = self.state.read().await;
        state
            .services
            .values()
            .filter(|s| s.service_type == service_type)
            .cloned()
            .collect()
    }

    /// Services whose last recorded health is `healthy`
    pub async fn get_healthy_services(&self) -> Vec<Service> {
        let state = self.state.read().await;
        state
            .services
            .values()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    pub async fn service_count(&self) -> usize {
        self.state.read().await.services.len()
    }

    pub async fn healthy_count(&self) -> usize {
        let state = self.state.read().await;
        state.services.values().filter(|s| s.is_healthy()).count()
    }

    pub async fn watcher_count(&self) -> usize {
        self.state.read().await.watchers.len()
    }

    /// Subscribe to registry events until `token` is cancelled.
    ///
    /// Delivery is at-most-once: if the returned queue is full when an event
    /// is published, that event is dropped for this watcher only. After
    /// cancellation no further events are delivered and the queue closes.
    /// Dropping the receiver also ends the subscription.
    pub async fn watch(&self, token: CancellationToken) -> mpsc::Receiver<RegistryEvent> {
        let (id, tx, rx) = self.state.write().await.watchers.subscribe(token.clone());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = token.cancelled() => "cancelled",
                _ = tx.closed() => "receiver dropped",
            };
            drop(tx);
            if state.write().await.watchers.remove(id) {
                debug!(watcher = id, reason, "Watcher removed");
            }
        });

        rx
    }

    async fn persist(&self, service: &Service) {
        let Some(storage) = &self.storage else {
            return;
        };
        let encoded = match serde_json::to_vec(service) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(service = %service.id, error = %e, "Failed to encode service");
                return;
            }
        };
        if let Err(e) = storage.set(&storage_key(&service.id), encoded, None).await {
            warn!(service = %service.id, error = %e, "Failed to persist service");
        }
    }
}

fn storage_key(id: &str) -> String {
    format!("{}{}", STORAGE_PREFIX, id)
}

#[async_trait]
impl ServiceLookup for ServiceRegistry {
    async fn get_service(&self, id: &str) -> RouterResult<Service> {
        let state = self.state.read().await;
        state
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::service_not_found(id))
    }

    async fn get_services(&self) -> Vec<Service> {
        let state = self.state.read().await;
        state.services.values().cloned().collect()
    }
}

#[async_trait]
impl HealthReporter for ServiceRegistry {
    async fn update_health_status(&self, id: &str, status: HealthStatus) -> RouterResult<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| RouterError::service_not_found(id))?;

        let previous = service.health_state();
        if status.is_healthy() {
            service.last_seen = service.last_seen.max(status.checked_at);
        }
        service.health = Some(status);
        let snapshot = service.clone();

        if previous != snapshot.health_state() {
            info!(
                service = %id,
                from = %previous,
                to = %snapshot.health_state(),
                "Service health changed"
            );
        }
        state.emit(EventType::Health, &snapshot);
        Ok(())
    }
}
