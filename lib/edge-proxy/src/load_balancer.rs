//! Load balancing strategies for choosing a backend instance

use edge_core::ServiceRegistration;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A selection algorithm over a candidate list.
///
/// `select` returns `None` only when there are no candidates. Strategies do
/// not filter by health; callers hand them an already filtered list.
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, candidates: &[ServiceRegistration]) -> Option<ServiceRegistration>;

    /// Called once the request routed to `instance` has finished
    fn release(&self, _instance: &ServiceRegistration) {}
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Visit candidates in order
    #[default]
    RoundRobin,
    /// Uniform random choice
    Random,
    /// Random choice proportional to the `weight` metadata
    Weighted,
    /// Fewest in-flight requests
    LeastConnections,
}

impl LoadBalancingStrategy {
    /// Build a fresh balancer with its own state
    pub fn build(self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinLoadBalancer::new()),
            LoadBalancingStrategy::Random => Arc::new(RandomLoadBalancer),
            LoadBalancingStrategy::Weighted => Arc::new(WeightedLoadBalancer),
            LoadBalancingStrategy::LeastConnections => {
                Arc::new(LeastConnectionsLoadBalancer::new())
            }
        }
    }
}

/// Round-robin over the current candidate list.
///
/// The cursor only ever grows; the index is taken modulo the candidate count
/// of each call, so a list that shrank between calls still yields a valid
/// member.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    cursor: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[ServiceRegistration]) -> Option<ServiceRegistration> {
        if candidates.is_empty() {
            return None;
        }
        // fetch_add is the single read-modify-write; wraps on usize overflow
        let current = self.cursor.fetch_add(1, Ordering::SeqCst);
        candidates.get(current % candidates.len()).cloned()
    }
}

/// Uniform random selection using the thread-local generator
#[derive(Debug, Default)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, candidates: &[ServiceRegistration]) -> Option<ServiceRegistration> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(index).cloned()
    }
}

/// Random selection weighted by `ServiceRegistration::weight`
#[derive(Debug, Default)]
pub struct WeightedLoadBalancer;

impl LoadBalancer for WeightedLoadBalancer {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[ServiceRegistration]) -> Option<ServiceRegistration> {
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|c| u64::from(c.weight())).sum();
        let mut point = rand::thread_rng().gen_range(0..total);
        for candidate in candidates {
            let weight = u64::from(candidate.weight());
            if point < weight {
                return Some(candidate.clone());
            }
            point -= weight;
        }
        candidates.last().cloned()
    }
}

/// Routes to the candidate with the fewest in-flight requests.
///
/// Choosing the instance and counting it happen under one lock, so concurrent
/// selections see each other's increments. `release` decrements and forgets
/// instances with nothing in flight.
#[derive(Debug, Default)]
pub struct LeastConnectionsLoadBalancer {
    in_flight: Mutex<HashMap<String, usize>>,
}

impl LeastConnectionsLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        // Each update is a single step, so a poisoned lock still holds valid counts
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current in-flight count for an instance
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.counts().get(instance_id).copied().unwrap_or(0)
    }

    /// Number of instances with requests in flight
    pub fn tracked(&self) -> usize {
        self.counts().len()
    }
}

impl LoadBalancer for LeastConnectionsLoadBalancer {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, candidates: &[ServiceRegistration]) -> Option<ServiceRegistration> {
        let mut counts = self.counts();
        // min_by_key keeps the first of equal elements
        let chosen = candidates
            .iter()
            .min_by_key(|c| counts.get(&c.instance_id).copied().unwrap_or(0))?;
        *counts.entry(chosen.instance_id.clone()).or_insert(0) += 1;
        Some(chosen.clone())
    }

    fn release(&self, instance: &ServiceRegistration) {
        let mut counts = self.counts();
        if let Some(count) = counts.get_mut(&instance.instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&instance.instance_id);
            }
        }
    }
}
