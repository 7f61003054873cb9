//! Service registry for backend instances

use crate::{CoreError, HealthStatus, Result, ServiceRegistration};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

type InstanceList = Arc<RwLock<Vec<ServiceRegistration>>>;

/// ServiceRegistry maintains the instances of every logical service.
///
/// Each service name owns an independently locked instance list. The outer
/// map is only write-locked when a name is first seen or its last instance
/// leaves, so mutating one service never stalls readers of another.
pub struct ServiceRegistry {
    // Map of service name to its instance list
    services: RwLock<HashMap<String, InstanceList>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    async fn instances(&self, service_name: &str) -> Option<InstanceList> {
        self.services.read().await.get(service_name).cloned()
    }

    /// Register an instance under a service name
    pub async fn register(
        &self,
        service_name: &str,
        registration: ServiceRegistration,
    ) -> Result<()> {
        validate(service_name, &registration)?;

        // The outer read guard is held across the push so pruning cannot
        // drop this list between lookup and insert
        {
            let services = self.services.read().await;
            if let Some(list) = services.get(service_name) {
                let mut instances = list.write().await;
                return insert_unique(&mut instances, service_name, registration);
            }
        }

        let mut services = self.services.write().await;
        let list = services.entry(service_name.to_string()).or_default().clone();
        let mut instances = list.write().await;
        insert_unique(&mut instances, service_name, registration)
    }

    /// Remove an instance. Returns whether it was present; absence is not an error.
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let Some(list) = self.instances(service_name).await else {
            return false;
        };
        let (removed, now_empty) = {
            let mut instances = list.write().await;
            let before = instances.len();
            instances.retain(|i| i.instance_id != instance_id);
            (instances.len() != before, instances.is_empty())
        };

        if removed {
            debug!(service = %service_name, instance_id = %instance_id, "Deregistered instance");
        }
        if now_empty {
            self.prune(service_name).await;
        }
        removed
    }

    /// Drop a service name whose instance list is empty
    async fn prune(&self, service_name: &str) {
        let mut services = self.services.write().await;
        let empty = match services.get(service_name) {
            Some(list) => list.read().await.is_empty(),
            None => false,
        };
        if empty {
            services.remove(service_name);
            debug!(service = %service_name, "Removed empty service");
        }
    }

    /// Snapshot of the instances registered for a service, empty if unknown
    pub async fn list(&self, service_name: &str) -> Vec<ServiceRegistration> {
        match self.instances(service_name).await {
            Some(list) => list.read().await.clone(),
            None => Vec::new(),
        }
    }

    /// Look up a single instance
    pub async fn get(&self, service_name: &str, instance_id: &str) -> Option<ServiceRegistration> {
        let list = self.instances(service_name).await?;
        let instances = list.read().await;
        instances
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned()
    }

    /// Replace an instance's record with one carrying the new health.
    ///
    /// The old record is removed and the new one added under a single write
    /// lock, so readers observe one or the other and never a partial update.
    pub async fn set_health(
        &self,
        service_name: &str,
        instance_id: &str,
        health: HealthStatus,
    ) -> bool {
        let Some(list) = self.instances(service_name).await else {
            return false;
        };
        let mut instances = list.write().await;
        let Some(pos) = instances.iter().position(|i| i.instance_id == instance_id) else {
            return false;
        };

        let updated = instances[pos].clone().with_health(health);
        instances.remove(pos);
        instances.insert(pos, updated);

        debug!(
            service = %service_name,
            instance_id = %instance_id,
            health = %health,
            "Updated instance health"
        );
        true
    }

    /// Names of services with at least one instance, sorted
    pub async fn list_services(&self) -> Vec<String> {
        let lists: Vec<(String, InstanceList)> = {
            let services = self.services.read().await;
            services
                .iter()
                .map(|(name, list)| (name.clone(), list.clone()))
                .collect()
        };

        let mut names = Vec::with_capacity(lists.len());
        for (name, list) in lists {
            if !list.read().await.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Number of instances registered for a service
    pub async fn instance_count(&self, service_name: &str) -> usize {
        match self.instances(service_name).await {
            Some(list) => list.read().await.len(),
            None => 0,
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_unique(
    instances: &mut Vec<ServiceRegistration>,
    service_name: &str,
    registration: ServiceRegistration,
) -> Result<()> {
    if instances
        .iter()
        .any(|i| i.instance_id == registration.instance_id)
    {
        return Err(CoreError::DuplicateInstance {
            service: service_name.to_string(),
            instance_id: registration.instance_id,
        });
    }

    debug!(
        service = %service_name,
        instance_id = %registration.instance_id,
        authority = %registration.authority(),
        "Registered instance"
    );
    instances.push(registration);
    Ok(())
}

fn validate(service_name: &str, registration: &ServiceRegistration) -> Result<()> {
    if service_name.is_empty() {
        return Err(CoreError::InvalidRegistration(
            "service name must not be empty".to_string(),
        ));
    }
    if registration.service_name != service_name {
        return Err(CoreError::InvalidRegistration(format!(
            "registration names service {} but was registered under {}",
            registration.service_name, service_name
        )));
    }
    if registration.instance_id.is_empty() {
        return Err(CoreError::InvalidRegistration(
            "instance id must not be empty".to_string(),
        ));
    }
    if registration.port == 0 {
        return Err(CoreError::InvalidRegistration(
            "port must be non-zero".to_string(),
        ));
    }
    Ok(())
}
