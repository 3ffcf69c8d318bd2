//! Load Balancer Module
//!
//! Weighted random selection among the eligible instances of a service.
//!
//! An instance is eligible when its status is running or degraded and its health
//! score is above the configured minimum. Its weight is
//! `score × (1 − load) × 1 / max(1, latency_ms)`, floored at a small positive
//! value so that every eligible instance keeps a non-zero chance.

use crate::config::LoadBalancerConfig;
use crate::health::HealthMonitor;
use crate::lb_defaults::MIN_WEIGHT;
use crate::models::{HealthStatus, ServiceInstance};
use crate::{RegistryError, Result};

use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Selection weight of an instance from its health
pub fn instance_weight(health: &HealthStatus) -> f64 {
    let load = health.load.unwrap_or(0.0).clamp(0.0, 1.0);
    let latency = health.latency_ms.unwrap_or(1.0).max(1.0);
    (health.score * (1.0 - load) / latency).max(MIN_WEIGHT)
}

/// Instance with its current weight
#[derive(Debug, Clone)]
pub struct WeightedInstance {
    pub instance: ServiceInstance,
    pub weight: f64,
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    health: Arc<HealthMonitor>,
    instances: DashMap<String, Vec<ServiceInstance>>,
    selections: DashMap<Uuid, AtomicU64>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, health: Arc<HealthMonitor>) -> Self {
        Self {
            config,
            health,
            instances: DashMap::new(),
            selections: DashMap::new(),
        }
    }

    /// Add or replace an instance
    pub fn add_instance(&self, instance: ServiceInstance) {
        let mut list = self
            .instances
            .entry(instance.service_name.clone())
            .or_default();
        list.retain(|existing| existing.id != instance.id);
        list.push(instance);
    }

    pub fn remove_instance(&self, service_name: &str, instance_id: Uuid) -> bool {
        self.selections.remove(&instance_id);
        let mut removed = false;
        if let Some(mut list) = self.instances.get_mut(service_name) {
            let before = list.len();
            list.retain(|instance| instance.id != instance_id);
            removed = list.len() != before;
        }
        self.instances
            .remove_if(service_name, |_, list| list.is_empty());
        removed
    }

    /// Drop every instance of a service
    pub fn remove_service(&self, service_name: &str) -> Vec<ServiceInstance> {
        let removed = self
            .instances
            .remove(service_name)
            .map(|(_, list)| list)
            .unwrap_or_default();
        for instance in &removed {
            self.selections.remove(&instance.id);
        }
        removed
    }

    /// Replace the instance list of a service
    pub fn set_instances(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        if instances.is_empty() {
            self.instances.remove(service_name);
        } else {
            self.instances.insert(service_name.to_string(), instances);
        }
    }

    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.instances
            .get(service_name)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        self.instances.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Eligible instances of a service with their weights
    pub fn eligible(&self, service_name: &str) -> Vec<WeightedInstance> {
        self.instances(service_name)
            .into_iter()
            .filter_map(|instance| {
                let snapshot = self.health.snapshot(instance.id)?;
                let eligible = snapshot.status.is_selectable()
                    && snapshot.health.score > self.config.min_health_score;
                eligible.then(|| WeightedInstance {
                    weight: instance_weight(&snapshot.health),
                    instance,
                })
            })
            .collect()
    }

    pub fn select_instance(&self, service_name: &str) -> Result<ServiceInstance> {
        self.select_with_rng(service_name, &mut rand::thread_rng())
    }

    /// Weighted random selection with a caller-provided generator
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        service_name: &str,
        rng: &mut R,
    ) -> Result<ServiceInstance> {
        let candidates = self.eligible(service_name);
        if candidates.is_empty() {
            return Err(RegistryError::NoHealthyInstances(service_name.to_string()));
        }

        let index = WeightedIndex::new(candidates.iter().map(|c| c.weight))
            .map_err(|e| RegistryError::Internal(format!("invalid selection weights: {}", e)))?;
        let chosen = candidates[index.sample(rng)].instance.clone();

        self.selections
            .entry(chosen.id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            "Selected instance {} ({}) for {}",
            chosen.id,
            chosen.address(),
            service_name
        );
        Ok(chosen)
    }

    /// Times an instance has been selected
    pub fn selections(&self, instance_id: Uuid) -> u64 {
        self.selections
            .get(&instance_id)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
