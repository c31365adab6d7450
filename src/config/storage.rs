use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Backing store for registry persistence
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: String,
    pub options: HashMap<String, String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "memory".to_string(),
            options: HashMap::new(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.storage_type.as_str() {
            "memory" => Ok(()),
            other => Err(anyhow::anyhow!("Unsupported storage type: {}", other)),
        }
    }
}
