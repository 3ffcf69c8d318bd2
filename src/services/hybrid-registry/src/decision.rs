//! Decision Engine
//!
//! Picks the transport for one call to a hybrid service. In-process routing is
//! chosen only when every condition holds:
//!
//! | input         | router requires                 |
//! |---------------|---------------------------------|
//! | co-location   | service mounted in this process |
//! | health        | `> health_threshold` (0.8)      |
//! | load          | `< load_threshold` (0.7)        |
//! | request size  | `< max_router_request_bytes`    |
//! | priority      | not low                         |
//!
//! Anything else resolves to REST. Missing telemetry reads as health 0.0 and
//! load 1.0, so an unobserved service is never routed in-process.
//!
//! Decisions are memoized for a short TTL. A cached decision remembers which
//! side of each threshold its health and load were on and is discarded as soon
//! as either side changes.

use crate::config::DecisionConfig;
use crate::health::HealthMonitor;
use crate::models::{CallPriority, ResolvedMethod};
use crate::transport::RouterTransport;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Everything a routing decision depends on
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionInput {
    pub health: f64,
    pub load: f64,
    pub co_located: bool,
    pub request_bytes: usize,
    pub priority: CallPriority,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    service: String,
    oversized: bool,
    priority: CallPriority,
    co_located: bool,
}

#[derive(Debug, Clone, Copy)]
struct CachedDecision {
    method: ResolvedMethod,
    health_ok: bool,
    load_ok: bool,
    expires_at: Instant,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    health: Arc<HealthMonitor>,
    router: Arc<dyn RouterTransport>,
    cache: DashMap<DecisionKey, CachedDecision>,
}

impl DecisionEngine {
    pub fn new(
        config: DecisionConfig,
        health: Arc<HealthMonitor>,
        router: Arc<dyn RouterTransport>,
    ) -> Self {
        Self {
            config,
            health,
            router,
            cache: DashMap::new(),
        }
    }

    /// Pure decision rule
    pub fn evaluate(&self, input: &DecisionInput) -> ResolvedMethod {
        let router = input.co_located
            && self.health_ok(input.health)
            && self.load_ok(input.load)
            && !self.oversized(input.request_bytes)
            && input.priority != CallPriority::Low;

        if router {
            ResolvedMethod::Router
        } else {
            ResolvedMethod::Rest
        }
    }

    /// Current inputs for a call to `service`
    pub fn gather(&self, service: &str, request_bytes: usize, priority: CallPriority) -> DecisionInput {
        let health = self.health.service_health(service);
        DecisionInput {
            health: health.score,
            load: health.load,
            co_located: self.router.is_mounted(service),
            request_bytes,
            priority,
        }
    }

    /// Decide the transport, returning whether the answer came from the cache
    pub fn decide(
        &self,
        service: &str,
        request_bytes: usize,
        priority: CallPriority,
    ) -> (ResolvedMethod, bool) {
        let input = self.gather(service, request_bytes, priority);
        let health_ok = self.health_ok(input.health);
        let load_ok = self.load_ok(input.load);
        let key = DecisionKey {
            service: service.to_string(),
            oversized: self.oversized(request_bytes),
            priority,
            co_located: input.co_located,
        };

        let now = Instant::now();
        if let Some(cached) = self.cache.get(&key).map(|entry| *entry) {
            if cached.expires_at > now && cached.health_ok == health_ok && cached.load_ok == load_ok {
                return (cached.method, true);
            }
        }

        let method = self.evaluate(&input);
        debug!(
            "Decided {} for {} (health {:.2}, load {:.2}, co-located {}, {} bytes, {:?})",
            method,
            service,
            input.health,
            input.load,
            input.co_located,
            request_bytes,
            priority
        );

        self.cache.insert(
            key,
            CachedDecision {
                method,
                health_ok,
                load_ok,
                expires_at: now + self.config.cache_ttl(),
            },
        );

        (method, false)
    }

    /// Forget cached decisions of a service
    pub fn invalidate(&self, service: &str) {
        self.cache.retain(|key, _| key.service != service);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    fn health_ok(&self, health: f64) -> bool {
        health > self.config.health_threshold
    }

    fn load_ok(&self, load: f64) -> bool {
        load < self.config.load_threshold
    }

    fn oversized(&self, request_bytes: usize) -> bool {
        request_bytes >= self.config.max_router_request_bytes
    }
}
