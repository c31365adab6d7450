use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RouterError, RouterResult};

/// Kind of backend behind a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Http,
    Https,
    Tcp,
    Udp,
    Grpc,
    Websocket,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Http => "http",
            ServiceType::Https => "https",
            ServiceType::Tcp => "tcp",
            ServiceType::Udp => "udp",
            ServiceType::Grpc => "grpc",
            ServiceType::Websocket => "websocket",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ServiceType::Http),
            "https" => Ok(ServiceType::Https),
            "tcp" => Ok(ServiceType::Tcp),
            "udp" => Ok(ServiceType::Udp),
            "grpc" => Ok(ServiceType::Grpc),
            "websocket" | "ws" => Ok(ServiceType::Websocket),
            other => Err(RouterError::invalid_request(format!(
                "unknown service type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health assessment of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub message: String,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

impl HealthStatus {
    pub fn new<S: Into<String>>(status: HealthState, message: S) -> Self {
        Self {
            status,
            message: message.into(),
            checked_at: Utc::now(),
            duration_ms: 0,
            details: HashMap::new(),
        }
    }

    pub fn healthy<S: Into<String>>(message: S) -> Self {
        Self::new(HealthState::Healthy, message)
    }

    pub fn unhealthy<S: Into<String>>(message: S) -> Self {
        Self::new(HealthState::Unhealthy, message)
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(HealthState::Unknown, message)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_detail<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// A registered backend instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

impl Service {
    /// Services that were never probed count as unknown
    pub fn health_state(&self) -> HealthState {
        self.health
            .as_ref()
            .map(|h| h.status)
            .unwrap_or(HealthState::Unknown)
    }

    pub fn is_healthy(&self) -> bool {
        self.health_state() == HealthState::Healthy
    }

    pub fn uses_tls(&self) -> bool {
        self.service_type == ServiceType::Https || self.protocol.eq_ignore_ascii_case("https")
    }

    pub fn scheme(&self) -> &'static str {
        if self.uses_tls() {
            "https"
        } else {
            "http"
        }
    }

    /// `address:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    pub(crate) fn validate(&self) -> RouterResult<()> {
        if self.id.trim().is_empty() {
            return Err(RouterError::invalid_request("service id cannot be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(RouterError::invalid_request(format!(
                "service {} has no address",
                self.id
            )));
        }
        if self.port == 0 {
            return Err(RouterError::invalid_request(format!(
                "service {} has no port",
                self.id
            )));
        }
        if self.weight == 0 {
            return Err(RouterError::invalid_request(format!(
                "service {} weight must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Registration payload: a service minus the fields the registry assigns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ServiceSpec {
    pub fn new<I: Into<String>, A: Into<String>>(id: I, address: A, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            port,
            protocol: default_protocol(),
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Build a service record. Timestamps are placeholders until the
    /// registry stamps them.
    pub fn into_service(self) -> Service {
        let now = Utc::now();
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name
        };
        Service {
            id: self.id,
            name,
            service_type: self.service_type,
            address: self.address,
            port: self.port,
            protocol: self.protocol,
            weight: self.weight.unwrap_or(1),
            metadata: self.metadata,
            tags: self.tags,
            created_at: now,
            updated_at: now,
            last_seen: now,
            health: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Register,
    Unregister,
    Update,
    Health,
}

/// Change notification delivered to watchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub service: Service,
    pub timestamp: DateTime<Utc>,
}

impl RegistryEvent {
    pub fn new(event_type: EventType, service: Service) -> Self {
        Self {
            event_type,
            service,
            timestamp: Utc::now(),
        }
    }
}
