//! End-to-end registry scenarios over the in-memory backends

use async_trait::async_trait;
use hybrid_registry::health::{HealthReport, ProbeOutcome, Prober};
use hybrid_registry::prelude::*;
use hybrid_registry::{
    DistributedCache, DurableStore, InMemoryDistributedCache, InMemoryStore, RouterTransport,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct IdleProber;

#[async_trait]
impl Prober for IdleProber {
    async fn probe(&self, _instance: &ServiceInstance, _method: ConnectionMethod) -> ProbeOutcome {
        ProbeOutcome::healthy(Duration::from_millis(1))
    }
}

fn config() -> Arc<HybridRegistryConfig> {
    let mut config = HybridRegistryConfig::in_memory();
    config.health.enabled = false;
    Arc::new(config)
}

fn components(
    store: Arc<InMemoryStore>,
    cache: Arc<InMemoryDistributedCache>,
    router: Arc<InProcessRouter>,
) -> RegistryComponents {
    RegistryComponents::builder(config())
        .store(store as Arc<dyn DurableStore>)
        .cache(cache as Arc<dyn DistributedCache>)
        .router(router as Arc<dyn RouterTransport>)
        .prober(Arc::new(IdleProber))
        .build()
        .unwrap()
}

fn fresh_components() -> RegistryComponents {
    components(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryDistributedCache::new()),
        Arc::new(InProcessRouter::new()),
    )
}

fn report(components: &RegistryComponents, id: Uuid, score: f64, latency_ms: f64, load: f64) {
    assert!(components.health.record_report(
        id,
        HealthReport {
            score,
            latency_ms: Some(latency_ms),
            load: Some(load),
        },
    ));
}

#[tokio::test(start_paused = true)]
async fn test_lookup_falls_through_to_store_when_upper_tiers_miss() {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(InMemoryDistributedCache::new());
    let components = components(store.clone(), cache.clone(), Arc::new(InProcessRouter::new()));

    components
        .registry
        .register(
            ServiceDescriptor::new("pricing", ConnectionMethod::Rest),
            ServiceInstance::new("pricing", "a", 1),
        )
        .await
        .unwrap();

    let first = components.registry.resolve("pricing").await.unwrap();
    assert_eq!(first.connection_method, ConnectionMethod::Rest);

    // Local entry expires and the distributed tier is down
    tokio::time::advance(Duration::from_secs(10)).await;
    cache.set_available(false);
    let reads_before = store.reads();

    let second = components.registry.resolve("pricing").await.unwrap();
    assert_eq!(second, first);
    assert!(store.reads() > reads_before);
}

#[tokio::test]
async fn test_hybrid_decision_follows_reported_health() {
    let router = Arc::new(InProcessRouter::new());
    let handler: Arc<dyn RouteHandler> =
        Arc::new(|_method: &str, args: &Value| -> std::result::Result<Value, hybrid_registry::TransportError> {
            Ok(args.clone())
        });
    router.mount("inventory", handler);

    let components = components(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryDistributedCache::new()),
        router,
    );

    let receipt = components
        .registry
        .register(
            ServiceDescriptor::new("inventory", ConnectionMethod::Hybrid),
            ServiceInstance::new("inventory", "a", 1),
        )
        .await
        .unwrap();

    report(&components, receipt.instance_id, 0.9, 5.0, 0.3);
    let (method, _) = components
        .decision
        .decide("inventory", 128, CallPriority::Medium);
    assert_eq!(method, ResolvedMethod::Router);

    // Crossing the health threshold is picked up despite the decision cache
    report(&components, receipt.instance_id, 0.5, 5.0, 0.3);
    let (method, cached) = components
        .decision
        .decide("inventory", 128, CallPriority::Medium);
    assert_eq!(method, ResolvedMethod::Rest);
    assert!(!cached);
}

#[tokio::test]
async fn test_selection_prefers_fast_instance() {
    let components = fresh_components();
    let descriptor = ServiceDescriptor::new("search", ConnectionMethod::Rest);

    let a = components
        .registry
        .register(descriptor.clone(), ServiceInstance::new("search", "a", 1))
        .await
        .unwrap();
    let b = components
        .registry
        .register(descriptor, ServiceInstance::new("search", "b", 1))
        .await
        .unwrap();

    report(&components, a.instance_id, 0.9, 10.0, 0.0);
    report(&components, b.instance_id, 0.9, 100.0, 0.0);

    let mut rng = StdRng::seed_from_u64(42);
    let draws = 10_000;
    let mut picked_a = 0;
    for _ in 0..draws {
        let chosen = components
            .load_balancer
            .select_with_rng("search", &mut rng)
            .unwrap();
        if chosen.id == a.instance_id {
            picked_a += 1;
        }
    }

    let share = picked_a as f64 / draws as f64;
    assert!(share > 0.88 && share < 0.94, "share of A was {}", share);
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let components = fresh_components();
    let receipt = components
        .registry
        .register(
            ServiceDescriptor::new("pricing", ConnectionMethod::Rest),
            ServiceInstance::new("pricing", "a", 1),
        )
        .await
        .unwrap();

    components
        .registry
        .deregister("pricing", receipt.instance_id)
        .await
        .unwrap();
    components
        .registry
        .deregister("pricing", receipt.instance_id)
        .await
        .unwrap();
    components
        .registry
        .deregister("pricing", Uuid::new_v4())
        .await
        .unwrap();

    assert!(components.registry.instances("pricing").await.unwrap().is_empty());
    assert!(!components.health.is_tracked(receipt.instance_id));
}

#[tokio::test]
async fn test_disabled_service_refuses_calls() {
    let router = Arc::new(InProcessRouter::new());
    let handler: Arc<dyn RouteHandler> =
        Arc::new(|_method: &str, _args: &Value| -> std::result::Result<Value, hybrid_registry::TransportError> {
            Ok(json!("charged"))
        });
    router.mount("billing", handler);

    let components = components(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryDistributedCache::new()),
        router,
    );
    let receipt = components
        .registry
        .register(
            ServiceDescriptor::new("billing", ConnectionMethod::Router),
            ServiceInstance::new("billing", "a", 1),
        )
        .await
        .unwrap();
    report(&components, receipt.instance_id, 1.0, 1.0, 0.0);

    assert_eq!(
        components.proxy.call("billing", "charge", json!({})).await.unwrap(),
        json!("charged")
    );

    components
        .registry
        .disable_service("billing", Some("ledger migration".to_string()))
        .await
        .unwrap();

    let err = components
        .proxy
        .call("billing", "charge", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ServiceDisabled);
    assert!(err.to_string().contains("ledger migration"));
}

#[tokio::test(start_paused = true)]
async fn test_method_change_is_visible_to_other_processes() {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(InMemoryDistributedCache::new());
    let writer = components(store.clone(), cache.clone(), Arc::new(InProcessRouter::new()));
    let reader = components(store, cache, Arc::new(InProcessRouter::new()));

    writer
        .registry
        .register(
            ServiceDescriptor::new("pricing", ConnectionMethod::Rest),
            ServiceInstance::new("pricing", "a", 1),
        )
        .await
        .unwrap();

    assert_eq!(
        reader.registry.resolve("pricing").await.unwrap().connection_method,
        ConnectionMethod::Rest
    );

    let change = writer
        .registry
        .update_connection_method("pricing", ConnectionMethod::Hybrid)
        .await
        .unwrap();
    assert!(change.cache_consistent);

    // The reader's local copy lives at most one local TTL
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(
        reader.registry.resolve("pricing").await.unwrap().connection_method,
        ConnectionMethod::Hybrid
    );
}

#[tokio::test]
async fn test_list_and_status_reflect_registrations() {
    let components = fresh_components();
    let receipt = components
        .registry
        .register(
            ServiceDescriptor::new("pricing", ConnectionMethod::Hybrid),
            ServiceInstance::new("pricing", "a", 1),
        )
        .await
        .unwrap();
    report(&components, receipt.instance_id, 0.95, 5.0, 0.2);

    let services = components.registry.list_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "pricing");
    assert_eq!(services[0].instance_count, 1);
    assert_eq!(services[0].healthy_instances, 1);

    let status = components.registry.get_service_status("pricing").await.unwrap();
    assert_eq!(status.connection_method, ConnectionMethod::Hybrid);
    assert_eq!(status.instances.len(), 1);
    assert_eq!(status.instances[0].status, InstanceStatus::Running);
}
