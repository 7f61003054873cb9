//! Gateway configuration loaded from YAML with environment overrides

use anyhow::{bail, Context, Result};
use edge_core::{HealthStatus, ServiceRegistration};
use edge_proxy::{HealthCheckConfig, LoadBalancingStrategy, RouteRule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "EDGE_CONFIG";
/// Environment variable overriding the listen address
pub const LISTEN_ENV: &str = "EDGE_LISTEN";
const DEFAULT_CONFIG_PATH: &str = "edge-gateway.yaml";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub upstream_timeout_ms: u64,
    pub load_balancing: LoadBalancingStrategy,
    pub exclude_unhealthy: bool,
    pub admin_enabled: bool,
    /// Value of the `X-Gateway` response header
    pub gateway_name: String,
    pub routes: Vec<RouteRule>,
    /// Instances registered at startup, by service name
    pub services: BTreeMap<String, Vec<StaticInstance>>,
    pub health_check: HealthCheckConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_timeout_ms: 30_000,
            load_balancing: LoadBalancingStrategy::default(),
            exclude_unhealthy: true,
            admin_enabled: true,
            gateway_name: edge_proxy::transform::DEFAULT_GATEWAY_NAME.to_string(),
            routes: Vec::new(),
            services: BTreeMap::new(),
            health_check: HealthCheckConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A statically configured backend instance
#[derive(Clone, Debug, Deserialize)]
pub struct StaticInstance {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthStatus,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load from `EDGE_CONFIG` (or the default path) and apply env overrides
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_path(Path::new(&path))?;
        config.apply_overrides(std::env::var(LISTEN_ENV).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; a missing file yields the defaults
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn apply_overrides(&mut self, listen: Option<String>) -> Result<()> {
        if let Some(listen) = listen {
            self.listen = listen
                .parse()
                .with_context(|| format!("Invalid {} value: {}", LISTEN_ENV, listen))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_timeout_ms == 0 {
            bail!("upstream_timeout_ms must be greater than zero");
        }
        for route in &self.routes {
            if !route.path_prefix.starts_with('/') {
                bail!("route prefix {} must start with '/'", route.path_prefix);
            }
            if route.service.is_empty() {
                bail!("route {} has no service", route.path_prefix);
            }
        }
        let health = &self.health_check;
        if health.unhealthy_threshold == 0 || health.healthy_threshold == 0 {
            bail!("health check thresholds must be at least 1");
        }
        if health.enabled && health.interval_secs == 0 {
            bail!("health check interval must be at least 1 second");
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Registrations for the statically configured instances
    pub fn static_registrations(&self) -> Vec<ServiceRegistration> {
        self.services
            .iter()
            .flat_map(|(service, instances)| {
                instances.iter().map(move |i| ServiceRegistration {
                    service_name: service.clone(),
                    instance_id: i.instance_id.clone(),
                    address: i.address.clone(),
                    port: i.port,
                    metadata: i.metadata.clone(),
                    health: i.health,
                })
            })
            .collect()
    }
}
