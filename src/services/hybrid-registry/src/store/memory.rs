//! In-memory durable store for single-process deployments and tests

use super::{DurableStore, StoreError};
use crate::models::{ServiceDescriptor, ServiceInstance};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    services: BTreeMap<String, ServiceDescriptor>,
    instances: HashMap<Uuid, ServiceInstance>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    reads: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Descriptor reads served so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get_service(&self, name: &str) -> Result<Option<ServiceDescriptor>, StoreError> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.read().services.get(name).cloned())
    }

    async fn put_service(&self, descriptor: &ServiceDescriptor) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let mut stored = descriptor.clone();
        if let Some(existing) = tables.services.get(&descriptor.name) {
            stored.registered_at = existing.registered_at;
        }
        tables.services.insert(descriptor.name.clone(), stored);
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        tables
            .instances
            .retain(|_, instance| instance.service_name != name);
        Ok(tables.services.remove(name).is_some())
    }

    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, StoreError> {
        self.check()?;
        Ok(self.tables.read().services.values().cloned().collect())
    }

    async fn get_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, StoreError> {
        self.check()?;
        let mut instances: Vec<ServiceInstance> = self
            .tables
            .read()
            .instances
            .values()
            .filter(|instance| instance.service_name == service_name)
            .cloned()
            .collect();
        instances.sort_by_key(|instance| instance.registered_at);
        Ok(instances)
    }

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, StoreError> {
        self.check()?;
        let mut instances: Vec<ServiceInstance> =
            self.tables.read().instances.values().cloned().collect();
        instances.sort_by(|a, b| {
            a.service_name
                .cmp(&b.service_name)
                .then(a.registered_at.cmp(&b.registered_at))
        });
        Ok(instances)
    }

    async fn put_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables.services.contains_key(&instance.service_name) {
            return Err(StoreError::Corrupt(format!(
                "instance {} references unknown service {}",
                instance.id, instance.service_name
            )));
        }
        let taken = tables.instances.values().any(|other| {
            other.id != instance.id
                && other.service_name == instance.service_name
                && other.host == instance.host
                && other.port == instance.port
        });
        if taken {
            return Err(StoreError::Conflict {
                service: instance.service_name.clone(),
                address: instance.address(),
            });
        }
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn delete_instance(
        &self,
        service_name: &str,
        instance_id: Uuid,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let owned = tables
            .instances
            .get(&instance_id)
            .map(|instance| instance.service_name == service_name)
            .unwrap_or(false);
        if owned {
            tables.instances.remove(&instance_id);
        }
        Ok(owned)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionMethod;

    #[tokio::test]
    async fn test_put_keeps_registration_time() {
        let store = InMemoryStore::new();
        let original = ServiceDescriptor::new("pricing", ConnectionMethod::Rest);
        store.put_service(&original).await.unwrap();

        let mut updated = ServiceDescriptor::new("pricing", ConnectionMethod::Router);
        updated.registered_at = original.registered_at + chrono::Duration::hours(1);
        store.put_service(&updated).await.unwrap();

        let stored = store.get_service("pricing").await.unwrap().unwrap();
        assert_eq!(stored.connection_method, ConnectionMethod::Router);
        assert_eq!(stored.registered_at, original.registered_at);
    }

    #[tokio::test]
    async fn test_delete_service_cascades_instances() {
        let store = InMemoryStore::new();
        store
            .put_service(&ServiceDescriptor::new("pricing", ConnectionMethod::Rest))
            .await
            .unwrap();
        store
            .put_instance(&ServiceInstance::new("pricing", "localhost", 9000))
            .await
            .unwrap();

        assert!(store.delete_service("pricing").await.unwrap());
        assert!(store.list_instances().await.unwrap().is_empty());
        assert!(!store.delete_service("pricing").await.unwrap());
    }

    #[tokio::test]
    async fn test_instance_requires_service() {
        let store = InMemoryStore::new();
        let result = store
            .put_instance(&ServiceInstance::new("ghost", "localhost", 9000))
            .await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_same_address_is_a_conflict() {
        let store = InMemoryStore::new();
        store
            .put_service(&ServiceDescriptor::new("pricing", ConnectionMethod::Rest))
            .await
            .unwrap();
        let first = ServiceInstance::new("pricing", "localhost", 9000);
        store.put_instance(&first).await.unwrap();
        // Rewriting the same instance is allowed
        store.put_instance(&first).await.unwrap();

        let result = store
            .put_instance(&ServiceInstance::new("pricing", "localhost", 9000))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_service("pricing").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
