//! Service Registry Module
//!
//! Read-through and write-through orchestration of the three lookup tiers:
//!
//! 1. [`LocalCache`] in this process (seconds)
//! 2. [`DistributedCache`] shared by every controller process (minutes)
//! 3. [`DurableStore`], the source of truth
//!
//! Lookups walk down the tiers and populate the upper ones on the way back.
//! Writes go to the store first and then invalidate both cache tiers, so the
//! next lookup from any process observes the change within one local TTL.
//! The registry also owns the instance lifecycle: it starts and stops health
//! tracking and keeps the load balancer rotation in sync with the store.

use crate::cache::{
    service_key, service_key_prefix, CacheError, DistributedCache, InMemoryDistributedCache,
    LocalCache, RedisCache,
};
use crate::config::{CacheBackend, HybridRegistryConfig, StoreBackend};
use crate::decision::DecisionEngine;
use crate::health::{EvictionNotice, HealthMonitor, Prober, TransportProber};
use crate::load_balancer::LoadBalancer;
use crate::models::{
    CacheStats, ConnectionMethod, HealthSummary, InstanceReport, InstanceStatus, MethodChange,
    RegistrationReceipt, ServiceDescriptor, ServiceHealthState, ServiceInstance,
    ServiceStatusReport, ServiceSummary, TierStats,
};
use crate::proxy::ServiceProxy;
use crate::store::{DurableStore, InMemoryStore, PostgresStore, StoreError};
use crate::transport::{HttpTransport, InProcessRouter, RestTransport, RouterTransport};
use crate::utils::validate_service_name;
use crate::{RegistryError, Result};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Service registry trait for dependency injection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register an instance, creating the descriptor on first registration
    async fn register(
        &self,
        descriptor: ServiceDescriptor,
        instance: ServiceInstance,
    ) -> Result<RegistrationReceipt>;

    /// Remove one instance; removing an unknown instance succeeds
    async fn deregister(&self, service: &str, instance_id: Uuid) -> Result<()>;

    /// Remove a service and every instance of it
    async fn deregister_service(&self, service: &str) -> Result<bool>;

    /// Current descriptor of a service
    async fn resolve(&self, service: &str) -> Result<ServiceDescriptor>;

    /// Drop a service from both cache tiers; false if the distributed tier could not confirm
    async fn invalidate(&self, service: &str) -> bool;

    /// Change the connection method without restarting anything
    async fn update_connection_method(
        &self,
        service: &str,
        method: ConnectionMethod,
    ) -> Result<MethodChange>;

    /// Switch a service to disabled, recording why
    async fn disable_service(&self, service: &str, reason: Option<String>) -> Result<MethodChange>;

    /// Apply several method changes, one result per service
    async fn bulk_update_connection_methods(
        &self,
        updates: HashMap<String, ConnectionMethod>,
    ) -> Vec<(String, Result<MethodChange>)>;

    /// Clear every registry key from both cache tiers
    async fn invalidate_all(&self) -> Result<u64>;

    /// Stored instances of a service
    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>>;

    async fn list_services(&self) -> Result<Vec<ServiceSummary>>;

    async fn get_service_status(&self, service: &str) -> Result<ServiceStatusReport>;

    async fn get_cache_stats(&self) -> Result<CacheStats>;
}

#[derive(Default)]
struct LookupCounters {
    distributed_hits: AtomicU64,
    distributed_misses: AtomicU64,
    distributed_errors: AtomicU64,
    durable_lookups: AtomicU64,
    stale_served: AtomicU64,
}

/// Tiered service registry
#[derive(Clone)]
pub struct ServiceRegistryImpl {
    config: Arc<HybridRegistryConfig>,
    store: Arc<dyn DurableStore>,
    distributed: Arc<dyn DistributedCache>,
    local: Arc<LocalCache<ServiceDescriptor>>,
    health: Arc<HealthMonitor>,
    load_balancer: Arc<LoadBalancer>,
    decision: Arc<DecisionEngine>,
    counters: Arc<LookupCounters>,
}

impl ServiceRegistryImpl {
    pub fn new(
        config: Arc<HybridRegistryConfig>,
        store: Arc<dyn DurableStore>,
        distributed: Arc<dyn DistributedCache>,
        health: Arc<HealthMonitor>,
        load_balancer: Arc<LoadBalancer>,
        decision: Arc<DecisionEngine>,
    ) -> Self {
        let local = Arc::new(LocalCache::new(
            config.cache.local.capacity,
            config.cache.local.ttl(),
        ));

        Self {
            config,
            store,
            distributed,
            local,
            health,
            load_balancer,
            decision,
            counters: Arc::new(LookupCounters::default()),
        }
    }

    /// Load stored instances and begin tracking them
    pub async fn initialize(&self) -> Result<()> {
        let count = self.sync_instances().await?;
        info!(
            "Service registry initialized with {} instance(s) from the {} store",
            count,
            self.store.backend_name()
        );
        Ok(())
    }

    /// Reconcile tracked instances with the durable store
    pub async fn sync_instances(&self) -> Result<usize> {
        let descriptors = self.store_op(self.store.list_services()).await?;
        let stored = self.store_op(self.store.list_instances()).await?;

        let methods: HashMap<String, ConnectionMethod> = descriptors
            .into_iter()
            .map(|d| (d.name, d.connection_method))
            .collect();

        let mut by_service: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for instance in stored {
            by_service
                .entry(instance.service_name.clone())
                .or_default()
                .push(instance);
        }

        let live: HashSet<Uuid> = by_service.values().flatten().map(|i| i.id).collect();

        // Drop instances removed by other processes
        for service in self.load_balancer.services() {
            for instance in self.load_balancer.instances(&service) {
                if !live.contains(&instance.id) {
                    self.health.untrack(instance.id);
                    self.load_balancer.remove_instance(&service, instance.id);
                    debug!("Dropped instance {} of {} removed from the store", instance.id, service);
                }
            }
        }

        let mut count = 0;
        for (service, instances) in by_service {
            let method = methods
                .get(&service)
                .copied()
                .unwrap_or(ConnectionMethod::Rest);
            for instance in &instances {
                self.health.track(instance.clone(), method);
            }
            count += instances.len();
            self.load_balancer.set_instances(&service, instances);
        }

        Ok(count)
    }

    /// Spawn the store reconciliation loop and the eviction consumer
    pub fn start_background_tasks(&self, shutdown: CancellationToken) {
        let refresh = self.clone();
        let refresh_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh.config.registry.refresh_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = refresh_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = refresh.sync_instances().await {
                            error!("Failed to reconcile instances with the store: {}", e);
                        }
                    }
                }
            }
        });

        if let Some(evictions) = self.health.take_eviction_receiver() {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.consume_evictions(evictions, shutdown).await;
            });
        }

        debug!("Registry background tasks started");
    }

    async fn consume_evictions(
        &self,
        mut evictions: mpsc::UnboundedReceiver<EvictionNotice>,
        shutdown: CancellationToken,
    ) {
        loop {
            let notice = tokio::select! {
                _ = shutdown.cancelled() => break,
                notice = evictions.recv() => match notice {
                    Some(notice) => notice,
                    None => break,
                },
            };

            info!(
                "Evicting instance {} of {} after prolonged failure",
                notice.instance_id, notice.service_name
            );
            if let Err(e) = self.deregister(&notice.service_name, notice.instance_id).await {
                error!("Failed to evict instance {}: {}", notice.instance_id, e);
            }
        }
    }

    fn key(&self, service: &str) -> String {
        service_key(&self.config.cache.distributed.redis.key_prefix, service)
    }

    async fn store_op<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let timeout = self.config.storage.operation_timeout();
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result.map_err(RegistryError::from),
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        }
    }

    async fn cache_op<T, F>(&self, operation: F) -> std::result::Result<T, CacheError>
    where
        F: Future<Output = std::result::Result<T, CacheError>>,
    {
        let timeout = self.config.cache.distributed.operation_timeout();
        match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        }
    }

    async fn distributed_get(&self, key: &str) -> Option<ServiceDescriptor> {
        match self.cache_op(self.distributed.get(key)).await {
            Ok(Some(raw)) => match serde_json::from_str::<ServiceDescriptor>(&raw) {
                Ok(descriptor) => {
                    self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
                    Some(descriptor)
                }
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    self.counters.distributed_misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.counters.distributed_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} cache lookup for {} failed, falling through: {}",
                    self.distributed.backend_name(),
                    key,
                    e
                );
                None
            }
        }
    }

    async fn distributed_put(&self, key: &str, descriptor: &ServiceDescriptor) {
        let raw = match serde_json::to_string(descriptor) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode descriptor {}: {}", descriptor.name, e);
                return;
            }
        };

        let ttl = self.config.cache.distributed.ttl();
        if let Err(e) = self.cache_op(self.distributed.set(key, &raw, ttl)).await {
            self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to populate cache entry {}: {}", key, e);
        }
    }

    fn serve_stale(&self, service: &str, key: &str, cause: RegistryError) -> Result<ServiceDescriptor> {
        if self.config.cache.serve_stale_on_store_failure {
            if let Some(descriptor) = self.local.get_stale(key, self.config.cache.max_stale()) {
                self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Durable store unavailable, serving last known descriptor of {}: {}",
                    service, cause
                );
                return Ok(descriptor);
            }
        }

        error!("Durable store unavailable resolving {}: {}", service, cause);
        Err(cause)
    }

    async fn load_descriptor(&self, service: &str) -> Result<ServiceDescriptor> {
        self.store_op(self.store.get_service(service))
            .await?
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))
    }

    async fn apply_method(
        &self,
        service: &str,
        method: ConnectionMethod,
        reason: Option<String>,
    ) -> Result<MethodChange> {
        let current = self.load_descriptor(service).await?;
        let old_method = current.connection_method;

        let mut updated = current;
        updated.connection_method = method;
        updated.disabled_reason = match method {
            ConnectionMethod::Disabled => reason.or(updated.disabled_reason),
            _ => None,
        };
        updated.updated_at = Utc::now();

        self.store_op(self.store.put_service(&updated)).await?;
        let cache_consistent = self.invalidate(service).await;

        self.health.set_service_method(service, method);
        self.decision.invalidate(service);

        if cache_consistent {
            info!("Connection method of {} changed {} -> {}", service, old_method, method);
        } else {
            warn!(
                "Connection method of {} changed {} -> {} but cache invalidation was not confirmed",
                service, old_method, method
            );
        }

        Ok(MethodChange {
            service: service.to_string(),
            old_method,
            new_method: method,
            cache_consistent,
        })
    }

    fn aggregate_state(
        method: ConnectionMethod,
        has_telemetry: bool,
        instances: &[InstanceReport],
    ) -> ServiceHealthState {
        if method == ConnectionMethod::Disabled {
            ServiceHealthState::Disabled
        } else if !has_telemetry || instances.is_empty() {
            ServiceHealthState::Unknown
        } else if instances.iter().all(|i| i.status == InstanceStatus::Running) {
            ServiceHealthState::Healthy
        } else if instances.iter().any(|i| i.status.is_selectable()) {
            ServiceHealthState::Degraded
        } else {
            ServiceHealthState::Unhealthy
        }
    }
}

#[async_trait]
impl ServiceRegistry for ServiceRegistryImpl {
    async fn register(
        &self,
        descriptor: ServiceDescriptor,
        instance: ServiceInstance,
    ) -> Result<RegistrationReceipt> {
        validate_service_name(&descriptor.name)?;

        if instance.service_name != descriptor.name {
            return Err(RegistryError::validation(
                "service_name",
                format!(
                    "instance belongs to '{}', not '{}'",
                    instance.service_name, descriptor.name
                ),
            ));
        }
        if instance.host.trim().is_empty() {
            return Err(RegistryError::validation("host", "host must not be empty"));
        }
        if instance.port == 0 {
            return Err(RegistryError::validation("port", "port must be between 1 and 65535"));
        }

        let service = descriptor.name.clone();
        let method = match self.store_op(self.store.get_service(&service)).await? {
            Some(existing) => existing.connection_method,
            None => {
                self.store_op(self.store.put_service(&descriptor)).await?;
                info!(
                    "Registered service {} with connection method {}",
                    service, descriptor.connection_method
                );
                descriptor.connection_method
            }
        };

        let existing = self.store_op(self.store.get_instances(&service)).await?;
        if existing
            .iter()
            .any(|other| other.id != instance.id && other.host == instance.host && other.port == instance.port)
        {
            return Err(RegistryError::DuplicateInstance {
                service,
                address: instance.address(),
            });
        }

        self.store_op(self.store.put_instance(&instance)).await?;
        let cache_consistent = self.invalidate(&service).await;

        self.health.track(instance.clone(), method);
        self.load_balancer.add_instance(instance.clone());
        self.decision.invalidate(&service);

        info!(
            "Registered instance {} of {} at {}",
            instance.id,
            service,
            instance.address()
        );

        Ok(RegistrationReceipt {
            service,
            instance_id: instance.id,
            cache_consistent,
        })
    }

    async fn deregister(&self, service: &str, instance_id: Uuid) -> Result<()> {
        let tracked = self.health.untrack(instance_id);
        let balanced = self.load_balancer.remove_instance(service, instance_id);
        let stored = self
            .store_op(self.store.delete_instance(service, instance_id))
            .await?;

        self.invalidate(service).await;
        self.decision.invalidate(service);

        if tracked || balanced || stored {
            info!("Deregistered instance {} of {}", instance_id, service);
        } else {
            debug!("Instance {} of {} was not registered", instance_id, service);
        }
        Ok(())
    }

    async fn deregister_service(&self, service: &str) -> Result<bool> {
        let mut instance_ids: HashSet<Uuid> = self
            .load_balancer
            .remove_service(service)
            .into_iter()
            .map(|instance| instance.id)
            .collect();
        instance_ids.extend(
            self.store_op(self.store.get_instances(service))
                .await?
                .into_iter()
                .map(|instance| instance.id),
        );
        for id in &instance_ids {
            self.health.untrack(*id);
        }

        let existed = self.store_op(self.store.delete_service(service)).await?;
        self.invalidate(service).await;
        self.decision.invalidate(service);

        if existed {
            info!(
                "Deregistered service {} and {} instance(s)",
                service,
                instance_ids.len()
            );
        }
        Ok(existed)
    }

    async fn resolve(&self, service: &str) -> Result<ServiceDescriptor> {
        let key = self.key(service);

        if let Some(descriptor) = self.local.get(&key) {
            return Ok(descriptor);
        }

        if let Some(descriptor) = self.distributed_get(&key).await {
            self.local.insert(key, descriptor.clone());
            return Ok(descriptor);
        }

        self.counters.durable_lookups.fetch_add(1, Ordering::Relaxed);
        match self.store_op(self.store.get_service(service)).await {
            Ok(Some(descriptor)) => {
                self.distributed_put(&key, &descriptor).await;
                self.local.insert(key, descriptor.clone());
                Ok(descriptor)
            }
            Ok(None) => Err(RegistryError::ServiceNotFound(service.to_string())),
            Err(e) => self.serve_stale(service, &key, e),
        }
    }

    async fn invalidate(&self, service: &str) -> bool {
        let key = self.key(service);
        self.local.invalidate(&key);

        match self.cache_op(self.distributed.delete(&key)).await {
            Ok(()) => true,
            Err(e) => {
                self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to invalidate cache entry {}: {}", key, e);
                false
            }
        }
    }

    async fn update_connection_method(
        &self,
        service: &str,
        method: ConnectionMethod,
    ) -> Result<MethodChange> {
        self.apply_method(service, method, None).await
    }

    async fn disable_service(&self, service: &str, reason: Option<String>) -> Result<MethodChange> {
        self.apply_method(service, ConnectionMethod::Disabled, reason)
            .await
    }

    async fn bulk_update_connection_methods(
        &self,
        updates: HashMap<String, ConnectionMethod>,
    ) -> Vec<(String, Result<MethodChange>)> {
        let mut updates: Vec<(String, ConnectionMethod)> = updates.into_iter().collect();
        updates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut results = Vec::with_capacity(updates.len());
        for (service, method) in updates {
            let result = self.update_connection_method(&service, method).await;
            if let Err(e) = &result {
                warn!("Bulk update of {} failed: {}", service, e);
            }
            results.push((service, result));
        }
        results
    }

    async fn invalidate_all(&self) -> Result<u64> {
        self.local.clear();
        self.decision.clear();

        let prefix = service_key_prefix(&self.config.cache.distributed.redis.key_prefix);
        let removed = self
            .cache_op(self.distributed.delete_prefix(&prefix))
            .await
            .map_err(|e| {
                self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
                RegistryError::from(e)
            })?;

        info!("Invalidated all registry cache entries ({} distributed keys)", removed);
        Ok(removed)
    }

    async fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        self.store_op(self.store.get_instances(service)).await
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>> {
        let descriptors = self.store_op(self.store.list_services()).await?;
        let instances = self.store_op(self.store.list_instances()).await?;

        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for instance in &instances {
            let healthy = self
                .health
                .snapshot(instance.id)
                .map(|snapshot| snapshot.health.is_healthy)
                .unwrap_or(false);
            let entry = counts.entry(instance.service_name.as_str()).or_default();
            entry.0 += 1;
            if healthy {
                entry.1 += 1;
            }
        }

        Ok(descriptors
            .iter()
            .map(|descriptor| {
                let (instance_count, healthy_instances) = counts
                    .get(descriptor.name.as_str())
                    .copied()
                    .unwrap_or_default();
                ServiceSummary {
                    name: descriptor.name.clone(),
                    connection_method: descriptor.connection_method,
                    instance_count,
                    healthy_instances,
                    registered_at: descriptor.registered_at,
                    updated_at: descriptor.updated_at,
                }
            })
            .collect())
    }

    async fn get_service_status(&self, service: &str) -> Result<ServiceStatusReport> {
        let descriptor = self.resolve(service).await?;
        let aggregate = self.health.service_health(service);

        let instances: Vec<InstanceReport> = self
            .load_balancer
            .instances(service)
            .into_iter()
            .map(|instance| {
                let snapshot = self.health.snapshot(instance.id);
                InstanceReport {
                    id: instance.id,
                    address: instance.address(),
                    status: snapshot
                        .as_ref()
                        .map(|s| s.status)
                        .unwrap_or(instance.status),
                    health: snapshot.map(|s| s.health).unwrap_or_default(),
                    selections: self.load_balancer.selections(instance.id),
                }
            })
            .collect();

        Ok(ServiceStatusReport {
            service: descriptor.name,
            status: Self::aggregate_state(
                descriptor.connection_method,
                aggregate.has_telemetry,
                &instances,
            ),
            connection_method: descriptor.connection_method,
            disabled_reason: descriptor.disabled_reason,
            health: HealthSummary {
                score: aggregate.score,
                latency_ms: aggregate.latency_ms,
                load: aggregate.has_telemetry.then_some(aggregate.load),
                last_check: aggregate.last_check,
            },
            instances,
        })
    }

    async fn get_cache_stats(&self) -> Result<CacheStats> {
        let prefix = service_key_prefix(&self.config.cache.distributed.redis.key_prefix);
        let distributed_size = match self.cache_op(self.distributed.count_prefix(&prefix)).await {
            Ok(size) => Some(size),
            Err(e) => {
                self.counters.distributed_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to size the distributed cache: {}", e);
                None
            }
        };

        Ok(CacheStats {
            local: TierStats::new(
                self.local.hits(),
                self.local.misses(),
                0,
                Some(self.local.len() as u64),
            ),
            distributed: TierStats::new(
                self.counters.distributed_hits.load(Ordering::Relaxed),
                self.counters.distributed_misses.load(Ordering::Relaxed),
                self.counters.distributed_errors.load(Ordering::Relaxed),
                distributed_size,
            ),
            durable_lookups: self.counters.durable_lookups.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
        })
    }
}

/// Fully wired registry, health monitor, balancer, decision engine and proxy
#[derive(Clone)]
pub struct RegistryComponents {
    pub config: Arc<HybridRegistryConfig>,
    pub registry: Arc<ServiceRegistryImpl>,
    pub health: Arc<HealthMonitor>,
    pub load_balancer: Arc<LoadBalancer>,
    pub decision: Arc<DecisionEngine>,
    pub proxy: Arc<ServiceProxy>,
    shutdown: CancellationToken,
}

impl RegistryComponents {
    pub fn builder(config: Arc<HybridRegistryConfig>) -> RegistryComponentsBuilder {
        RegistryComponentsBuilder {
            config,
            store: None,
            cache: None,
            router: None,
            rest: None,
            prober: None,
        }
    }

    /// Everything in memory, for a single process and for tests
    pub fn in_memory(
        config: Arc<HybridRegistryConfig>,
        router: Arc<dyn RouterTransport>,
    ) -> Result<Self> {
        Self::builder(config).router(router).build()
    }

    /// Connect the configured store and cache backends
    pub async fn connect(
        config: Arc<HybridRegistryConfig>,
        router: Arc<dyn RouterTransport>,
    ) -> Result<Self> {
        let store: Arc<dyn DurableStore> = match config.storage.backend {
            StoreBackend::Postgres => {
                let store = PostgresStore::connect(&config.storage.postgres).await?;
                if config.registry.create_schema {
                    store.create_schema().await?;
                }
                info!("Connected to PostgreSQL durable store");
                Arc::new(store)
            }
            StoreBackend::Memory => {
                warn!("Using the in-memory durable store; registrations will not survive a restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let cache: Arc<dyn DistributedCache> = match config.cache.distributed.backend {
            CacheBackend::Redis => {
                let cache = RedisCache::connect(&config.cache.distributed.redis).await?;
                info!("Connected to Redis distributed cache");
                Arc::new(cache)
            }
            CacheBackend::Memory => Arc::new(InMemoryDistributedCache::new()),
        };

        Self::builder(config)
            .store(store)
            .cache(cache)
            .router(router)
            .build()
    }

    /// Start reconciliation and eviction handling
    pub fn start_background_tasks(&self) {
        self.registry.start_background_tasks(self.shutdown.clone());
    }

    /// Stop background tasks and every probe loop
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.health.shutdown().await;
    }
}

pub struct RegistryComponentsBuilder {
    config: Arc<HybridRegistryConfig>,
    store: Option<Arc<dyn DurableStore>>,
    cache: Option<Arc<dyn DistributedCache>>,
    router: Option<Arc<dyn RouterTransport>>,
    rest: Option<Arc<dyn RestTransport>>,
    prober: Option<Arc<dyn Prober>>,
}

impl RegistryComponentsBuilder {
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn router(mut self, router: Arc<dyn RouterTransport>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn rest(mut self, rest: Arc<dyn RestTransport>) -> Self {
        self.rest = Some(rest);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn build(self) -> Result<RegistryComponents> {
        let config = self.config;

        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryStore::new()),
        };
        let cache: Arc<dyn DistributedCache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(InMemoryDistributedCache::new()),
        };
        let router: Arc<dyn RouterTransport> = match self.router {
            Some(router) => router,
            None => Arc::new(InProcessRouter::new()),
        };
        let rest: Arc<dyn RestTransport> = match self.rest {
            Some(rest) => rest,
            None => Arc::new(
                HttpTransport::new().map_err(|e| RegistryError::Internal(e.to_string()))?,
            ),
        };
        let prober: Arc<dyn Prober> = match self.prober {
            Some(prober) => prober,
            None => Arc::new(TransportProber::new(
                Arc::clone(&router),
                Arc::clone(&rest),
                config.health.probe_timeout(),
            )),
        };

        let health = Arc::new(HealthMonitor::new(Arc::clone(&config), prober));
        let load_balancer = Arc::new(LoadBalancer::new(
            config.load_balancer.clone(),
            Arc::clone(&health),
        ));
        let decision = Arc::new(DecisionEngine::new(
            config.decision.clone(),
            Arc::clone(&health),
            Arc::clone(&router),
        ));
        let registry = Arc::new(ServiceRegistryImpl::new(
            Arc::clone(&config),
            store,
            cache,
            Arc::clone(&health),
            Arc::clone(&load_balancer),
            Arc::clone(&decision),
        ));
        let proxy = Arc::new(ServiceProxy::new(
            config.proxy.clone(),
            Arc::clone(&registry) as Arc<dyn ServiceRegistry>,
            Arc::clone(&decision),
            Arc::clone(&load_balancer),
            Arc::clone(&health),
            router,
            rest,
        ));

        Ok(RegistryComponents {
            config,
            registry,
            health,
            load_balancer,
            decision,
            proxy,
            shutdown: CancellationToken::new(),
        })
    }
}
