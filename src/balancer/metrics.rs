use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Response time aggregate in milliseconds
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseTimeStats {
    pub count: u64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Exponential moving average, alpha 0.1
    pub ema_ms: f64,
}

impl ResponseTimeStats {
    fn record(&mut self, elapsed_ms: f64) {
        if self.count == 0 {
            self.min_ms = elapsed_ms;
            self.max_ms = elapsed_ms;
            self.ema_ms = elapsed_ms;
        } else {
            self.min_ms = self.min_ms.min(elapsed_ms);
            self.max_ms = self.max_ms.max(elapsed_ms);
            self.ema_ms = 0.9 * self.ema_ms + 0.1 * elapsed_ms;
        }
        self.count += 1;
        self.total_ms += elapsed_ms;
        self.avg_ms = self.total_ms / self.count as f64;
    }
}

/// Snapshot served by the admin metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BalancerMetrics {
    pub algorithm: String,
    pub total_requests: u64,
    pub requests_per_algorithm: HashMap<String, u64>,
    pub requests_per_service: HashMap<String, u64>,
    pub response_time: ResponseTimeStats,
    pub response_time_per_service: HashMap<String, ResponseTimeStats>,
    /// Fraction of failed responses per service, 0.0 to 1.0
    pub error_rate: HashMap<String, f64>,
    pub active_connections: HashMap<String, u32>,
    pub last_updated: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug)]
struct MetricsState {
    total_requests: u64,
    requests_per_algorithm: HashMap<String, u64>,
    requests_per_service: HashMap<String, u64>,
    response_time: ResponseTimeStats,
    response_time_per_service: HashMap<String, ResponseTimeStats>,
    errors_per_service: HashMap<String, u64>,
    last_updated: DateTime<Utc>,
    last_reset: DateTime<Utc>,
}

impl Default for MetricsState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total_requests: 0,
            requests_per_algorithm: HashMap::new(),
            requests_per_service: HashMap::new(),
            response_time: ResponseTimeStats::default(),
            response_time_per_service: HashMap::new(),
            errors_per_service: HashMap::new(),
            last_updated: now,
            last_reset: now,
        }
    }
}

/// Selection and response counters owned by the load balancer
#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_selection(&self, algorithm: &str, service_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.total_requests += 1;
        *state
            .requests_per_algorithm
            .entry(algorithm.to_string())
            .or_default() += 1;
        *state
            .requests_per_service
            .entry(service_id.to_string())
            .or_default() += 1;
        state.last_updated = Utc::now();
    }

    /// Record a request result for metrics tracking
    pub fn record_response(&self, service_id: &str, elapsed: Duration, success: bool) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.response_time.record(elapsed_ms);
        state
            .response_time_per_service
            .entry(service_id.to_string())
            .or_default()
            .record(elapsed_ms);
        if !success {
            *state
                .errors_per_service
                .entry(service_id.to_string())
                .or_default() += 1;
        }
        state.last_updated = Utc::now();

        debug!(
            service = %service_id,
            success,
            elapsed_ms,
            "Recorded upstream response"
        );
    }

    pub fn snapshot(&self, algorithm: &str, active: HashMap<String, u32>) -> BalancerMetrics {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let error_rate = state
            .response_time_per_service
            .iter()
            .map(|(id, rt)| {
                let errors = state.errors_per_service.get(id).copied().unwrap_or(0);
                let rate = if rt.count > 0 {
                    errors as f64 / rt.count as f64
                } else {
                    0.0
                };
                (id.clone(), rate)
            })
            .collect();

        BalancerMetrics {
            algorithm: algorithm.to_string(),
            total_requests: state.total_requests,
            requests_per_algorithm: state.requests_per_algorithm.clone(),
            requests_per_service: state.requests_per_service.clone(),
            response_time: state.response_time.clone(),
            response_time_per_service: state.response_time_per_service.clone(),
            error_rate,
            active_connections: active,
            last_updated: state.last_updated,
            last_reset: state.last_reset,
        }
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = MetricsState::default();
    }
}
