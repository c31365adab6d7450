use hyper::Request;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::algorithms::{self, Algorithm, BalancingAlgorithm, SelectionContext};
use super::metrics::{BalancerMetrics, MetricsCollector};
use super::state::{ConnectionGuard, ConnectionTracker};
use crate::config::load_balancer::validate_weights;
use crate::config::LoadBalancerConfig;
use crate::error::{RouterError, RouterResult};
use crate::registry::Service;

/// Client address for a request: first X-Forwarded-For hop, then
/// X-Real-IP, then the peer socket address
pub fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| peer_addr(req).map(|addr| addr.ip()))
}

/// Socket address of the connected peer, set by the listener
pub fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions().get::<SocketAddr>().copied()
}

/// Picks one backend per request with a swappable strategy
pub struct LoadBalancer {
    strategy: RwLock<Arc<dyn BalancingAlgorithm>>,
    weights: RwLock<HashMap<String, u32>>,
    connections: Arc<ConnectionTracker>,
    metrics: MetricsCollector,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalancerConfig) -> RouterResult<Self> {
        let algorithm: Algorithm = config.algorithm.parse()?;
        validate_weights(&config.weights).map_err(|e| RouterError::config(e.to_string()))?;

        Ok(Self {
            strategy: RwLock::new(algorithms::create(algorithm)),
            weights: RwLock::new(config.weights.clone()),
            connections: Arc::new(ConnectionTracker::new()),
            metrics: MetricsCollector::new(),
        })
    }

    fn current(&self) -> Arc<dyn BalancingAlgorithm> {
        Arc::clone(&self.strategy.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Select a target for `req` from `candidates`
    pub fn select_service<B>(&self, req: &Request<B>, candidates: &[Service]) -> RouterResult<Service> {
        self.select_for_client(client_ip(req), candidates)
    }

    pub fn select_for_client(
        &self,
        client_ip: Option<IpAddr>,
        candidates: &[Service],
    ) -> RouterResult<Service> {
        if candidates.is_empty() {
            return Err(RouterError::NoHealthyServices);
        }

        let strategy = self.current();
        let weights = self.weights.read().unwrap_or_else(PoisonError::into_inner);
        let ctx = SelectionContext {
            client_ip,
            weights: &weights,
            connections: &self.connections,
        };
        let index = strategy
            .select(candidates, &ctx)
            .ok_or(RouterError::NoHealthyServices)?;
        drop(weights);

        let service = candidates[index].clone();
        let algorithm = strategy.kind().as_str();
        self.metrics.record_selection(algorithm, &service.id);
        metrics::counter!(
            "router_balancer_selections_total",
            "algorithm" => algorithm,
            "service" => service.id.clone()
        )
        .increment(1);

        debug!(service = %service.id, algorithm, "Selected upstream");
        Ok(service)
    }

    /// Swap the active strategy. An unknown name leaves the current one in place.
    pub fn set_algorithm(&self, name: &str) -> RouterResult<Algorithm> {
        let algorithm: Algorithm = name.parse()?;
        let fresh = algorithms::create(algorithm);
        let previous = {
            let mut strategy = self.strategy.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *strategy, fresh)
        };
        info!(from = %previous.kind(), to = %algorithm, "Load balancing algorithm changed");
        Ok(algorithm)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.current().kind()
    }

    /// Replace static weight overrides, each within 1..=100
    pub fn set_weights(&self, weights: HashMap<String, u32>) -> RouterResult<()> {
        validate_weights(&weights).map_err(|e| RouterError::invalid_request(e.to_string()))?;
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
        self.current().reset();
        Ok(())
    }

    pub fn weights(&self) -> HashMap<String, u32> {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the active strategy's cursors and counters
    pub fn reset(&self) {
        self.current().reset();
    }

    /// Mark a request to `service_id` as in flight until the guard drops
    pub fn begin_request(&self, service_id: &str) -> ConnectionGuard {
        self.connections.begin(service_id)
    }

    pub fn record_response(&self, service_id: &str, elapsed: Duration, success: bool) {
        self.metrics.record_response(service_id, elapsed, success);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections.total_active()
    }

    /// Drop per-service connection state for services no longer registered
    pub fn forget_missing(&self, live: &std::collections::HashSet<String>) {
        self.connections.retain_services(live);
    }

    pub fn get_metrics(&self) -> BalancerMetrics {
        self.metrics
            .snapshot(self.algorithm().as_str(), self.connections.snapshot())
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
        info!("Load balancer metrics reset");
    }
}
