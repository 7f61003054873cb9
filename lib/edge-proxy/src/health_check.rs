//! Health checking for registered instances
//!
//! The monitor plays the part of the external health-check collaborator: it
//! probes instances and writes the outcome back through the registry. The
//! routing path itself only ever reads the resulting advisory health.

use edge_core::{HealthStatus, ServiceRegistration, ServiceRegistry};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Seconds between probe rounds
    pub interval_secs: u64,
    /// Seconds before a single probe gives up
    pub timeout_secs: u64,
    /// Consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive successes before marking healthy
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 5,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Probes a single instance with a TCP connect
pub struct HealthChecker {
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Whether a TCP connection to the instance succeeds within the timeout
    pub async fn check_instance(&self, instance: &ServiceRegistration) -> bool {
        let authority = instance.authority();
        match time::timeout(self.timeout, tokio::net::TcpStream::connect(&authority)).await {
            Ok(Ok(_)) => {
                debug!("Instance {} ({}) is reachable", instance.instance_id, authority);
                true
            }
            Ok(Err(e)) => {
                debug!("Instance {} ({}) probe failed: {}", instance.instance_id, authority, e);
                false
            }
            Err(_) => {
                debug!("Instance {} ({}) probe timed out", instance.instance_id, authority);
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ProbeHistory {
    consecutive_successes: u32,
    consecutive_failures: u32,
}

/// Periodically probes every registered instance and updates its health
pub struct HealthCheckMonitor {
    config: HealthCheckConfig,
    checker: HealthChecker,
    registry: Arc<ServiceRegistry>,
    history: HashMap<(String, String), ProbeHistory>,
}

impl HealthCheckMonitor {
    pub fn new(config: HealthCheckConfig, registry: Arc<ServiceRegistry>) -> Self {
        let checker = HealthChecker::new(config.timeout());
        Self {
            config,
            checker,
            registry,
            history: HashMap::new(),
        }
    }

    /// Probe every instance once. Returns the number of health changes applied.
    pub async fn run_once(&mut self) -> usize {
        let mut instances = Vec::new();
        for service in self.registry.list_services().await {
            instances.extend(self.registry.list(&service).await);
        }

        let checker = &self.checker;
        let outcomes = join_all(instances.iter().map(|i| checker.check_instance(i))).await;

        let mut seen = HashSet::new();
        let mut changes = 0;
        for (instance, healthy) in instances.iter().zip(outcomes) {
            let key = (instance.service_name.clone(), instance.instance_id.clone());
            seen.insert(key.clone());

            let history = self.history.entry(key).or_default();
            let Some(next) = next_health(&self.config, history, instance.health, healthy) else {
                continue;
            };

            if self
                .registry
                .set_health(&instance.service_name, &instance.instance_id, next)
                .await
            {
                changes += 1;
                if next == HealthStatus::Unhealthy {
                    warn!(
                        service = %instance.service_name,
                        instance_id = %instance.instance_id,
                        "Instance marked unhealthy"
                    );
                } else {
                    info!(
                        service = %instance.service_name,
                        instance_id = %instance.instance_id,
                        "Instance marked {}", next
                    );
                }
            }
        }

        // Forget instances that have left the registry
        self.history.retain(|key, _| seen.contains(key));
        changes
    }

    /// Run probe rounds forever on the configured interval
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Health check monitor started with interval: {:?}",
                self.config.interval()
            );
            let mut ticker = time::interval(self.config.interval());
            loop {
                ticker.tick().await;
                let changes = self.run_once().await;
                debug!("Health check round applied {} changes", changes);
            }
        })
    }
}

/// Fold one probe outcome into the history; returns a new health if it flips
fn next_health(
    config: &HealthCheckConfig,
    history: &mut ProbeHistory,
    current: HealthStatus,
    healthy: bool,
) -> Option<HealthStatus> {
    if healthy {
        history.consecutive_failures = 0;
        history.consecutive_successes = history.consecutive_successes.saturating_add(1);
        (history.consecutive_successes >= config.healthy_threshold
            && current != HealthStatus::Healthy)
            .then_some(HealthStatus::Healthy)
    } else {
        history.consecutive_successes = 0;
        history.consecutive_failures = history.consecutive_failures.saturating_add(1);
        (history.consecutive_failures >= config.unhealthy_threshold
            && current != HealthStatus::Unhealthy)
            .then_some(HealthStatus::Unhealthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(unhealthy: u32, healthy: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs: 1,
            timeout_secs: 1,
            unhealthy_threshold: unhealthy,
            healthy_threshold: healthy,
        }
    }

    #[test]
    fn test_default_config() {
        let config = HealthCheckConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.healthy_threshold, 2);
    }

    #[test]
    fn test_thresholds() {
        let config = config(3, 2);
        let mut history = ProbeHistory::default();

        assert_eq!(next_health(&config, &mut history, HealthStatus::Unknown, false), None);
        assert_eq!(next_health(&config, &mut history, HealthStatus::Unknown, false), None);
        assert_eq!(
            next_health(&config, &mut history, HealthStatus::Unknown, false),
            Some(HealthStatus::Unhealthy)
        );
        // Already unhealthy: no repeated transition
        assert_eq!(next_health(&config, &mut history, HealthStatus::Unhealthy, false), None);

        assert_eq!(next_health(&config, &mut history, HealthStatus::Unhealthy, true), None);
        assert_eq!(
            next_health(&config, &mut history, HealthStatus::Unhealthy, true),
            Some(HealthStatus::Healthy)
        );
    }

    #[test]
    fn test_success_resets_failures() {
        let config = config(2, 5);
        let mut history = ProbeHistory::default();

        next_health(&config, &mut history, HealthStatus::Healthy, false);
        next_health(&config, &mut history, HealthStatus::Healthy, true);
        assert_eq!(next_health(&config, &mut history, HealthStatus::Healthy, false), None);
    }

    #[tokio::test]
    async fn test_check_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let checker = HealthChecker::new(Duration::from_secs(1));

        let reg = ServiceRegistration::new("orders", "a", live.ip().to_string(), live.port());
        assert!(checker.check_instance(&reg).await);

        drop(listener);
        assert!(!checker.check_instance(&reg).await);
    }

    #[tokio::test]
    async fn test_monitor_updates_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let registry = Arc::new(ServiceRegistry::new());
        registry
            .register(
                "orders",
                ServiceRegistration::new("orders", "live", "127.0.0.1", live.port()),
            )
            .await
            .unwrap();
        registry
            .register(
                "orders",
                ServiceRegistration::new("orders", "dead", "127.0.0.1", closed.port()),
            )
            .await
            .unwrap();

        let mut monitor = HealthCheckMonitor::new(config(1, 1), registry.clone());
        assert_eq!(monitor.run_once().await, 2);

        let live_reg = registry.get("orders", "live").await.unwrap();
        let dead_reg = registry.get("orders", "dead").await.unwrap();
        assert_eq!(live_reg.health, HealthStatus::Healthy);
        assert_eq!(dead_reg.health, HealthStatus::Unhealthy);

        // Stable state: nothing more to change
        assert_eq!(monitor.run_once().await, 0);

        registry.deregister("orders", "dead").await;
        monitor.run_once().await;
        assert_eq!(monitor.history.len(), 1);
        drop(listener);
    }
}
