use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Connection statistics for a service
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub active_connections: u32,
    pub total_requests: u64,
    pub last_request: Option<Instant>,
}

/// In-flight request counts per service, bracketed by the balancer
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    stats: Mutex<HashMap<String, ConnectionStats>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, service_id: &str) -> u32 {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .map(|s| s.active_connections)
            .unwrap_or(0)
    }

    pub fn total_active(&self) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.active_connections as u64)
            .sum()
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (id.clone(), s.active_connections))
            .collect()
    }

    fn increment(&self, service_id: &str) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(service_id.to_string()).or_default();
        entry.active_connections += 1;
        entry.total_requests += 1;
        entry.last_request = Some(Instant::now());
    }

    fn decrement(&self, service_id: &str) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = stats.get_mut(service_id) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
        }
    }

    /// Count a request as in flight until the guard drops
    pub fn begin(self: &Arc<Self>, service_id: &str) -> ConnectionGuard {
        self.increment(service_id);
        ConnectionGuard {
            tracker: Arc::clone(self),
            service_id: service_id.to_string(),
        }
    }

    /// Drop counters for services no longer registered and idle
    pub fn retain_services(&self, live: &std::collections::HashSet<String>) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, s| live.contains(id) || s.active_connections > 0);
    }
}

/// Decrements the service's in-flight count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    service_id: String,
}

impl ConnectionGuard {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.decrement(&self.service_id);
    }
}
