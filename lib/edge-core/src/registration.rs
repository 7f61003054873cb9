//! Backend instance registrations
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key holding the relative weight of an instance
pub const WEIGHT_METADATA_KEY: &str = "weight";

/// Advisory health of a backend instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One backend instance of a logical service.
///
/// Registrations are values: the registry hands out copies and replaces a
/// record wholesale when something about it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthStatus,
}

impl ServiceRegistration {
    /// Create a registration with no metadata and unknown health
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            port,
            metadata: BTreeMap::new(),
            health: HealthStatus::Unknown,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// `address:port` of the instance, bracketing bare IPv6 addresses
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Relative weight from the `weight` metadata key, 1 when absent or invalid
    pub fn weight(&self) -> u32 {
        self.metadata
            .get(WEIGHT_METADATA_KEY)
            .and_then(|w| w.trim().parse::<u32>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health == HealthStatus::Unhealthy
    }
}
