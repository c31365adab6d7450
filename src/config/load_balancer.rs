use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::balancer::Algorithm;

pub const MIN_WEIGHT: u32 = 1;
pub const MAX_WEIGHT: u32 = 100;

/// Load balancer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub algorithm: String,
    /// Static weight overrides keyed by service id
    pub weights: HashMap<String, u32>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin.as_str().to_string(),
            weights: HashMap::new(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.algorithm
            .parse::<Algorithm>()
            .map_err(|_| anyhow::anyhow!("Invalid load balancer algorithm: {}", self.algorithm))?;
        validate_weights(&self.weights)
    }
}

pub fn validate_weights(weights: &HashMap<String, u32>) -> anyhow::Result<()> {
    for (id, weight) in weights {
        if !(MIN_WEIGHT..=MAX_WEIGHT).contains(weight) {
            return Err(anyhow::anyhow!(
                "Weight for service '{}' must be between {} and {}, got {}",
                id,
                MIN_WEIGHT,
                MAX_WEIGHT,
                weight
            ));
        }
    }
    Ok(())
}
