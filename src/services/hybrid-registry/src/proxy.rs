//! Service Proxy
//!
//! Single entry point for calls to registered services. A call resolves the
//! service, refuses disabled services outright, picks a transport (directly or
//! through the decision engine for hybrid services), selects an instance and
//! makes the attempt. Hybrid calls fall back to the other transport exactly
//! once. Transport errors are folded into [`RegistryError`] here and never
//! reach the caller as such.

use crate::config::ProxyConfig;
use crate::decision::DecisionEngine;
use crate::health::HealthMonitor;
use crate::load_balancer::LoadBalancer;
use crate::models::{
    AttemptFailure, CallRequest, CallResponse, ConnectionDecision, ConnectionMethod,
    ResolvedMethod, ServiceInstance,
};
use crate::registry::ServiceRegistry;
use crate::transport::{RestTransport, RouterTransport, TransportError};
use crate::{RegistryError, Result};

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

const DEFAULT_DISABLED_REASON: &str = "service disabled by operator";

pub struct ServiceProxy {
    config: ProxyConfig,
    registry: Arc<dyn ServiceRegistry>,
    decision: Arc<DecisionEngine>,
    load_balancer: Arc<LoadBalancer>,
    health: Arc<HealthMonitor>,
    router: Arc<dyn RouterTransport>,
    rest: Arc<dyn RestTransport>,
}

impl ServiceProxy {
    pub fn new(
        config: ProxyConfig,
        registry: Arc<dyn ServiceRegistry>,
        decision: Arc<DecisionEngine>,
        load_balancer: Arc<LoadBalancer>,
        health: Arc<HealthMonitor>,
        router: Arc<dyn RouterTransport>,
        rest: Arc<dyn RestTransport>,
    ) -> Self {
        Self {
            config,
            registry,
            decision,
            load_balancer,
            health,
            router,
            rest,
        }
    }

    /// Call `method` on `service` with medium priority
    pub async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value> {
        self.call_with(CallRequest::new(service, method, args))
            .await
            .map(|response| response.value)
    }

    pub async fn call_with(&self, request: CallRequest) -> Result<CallResponse> {
        let descriptor = self.registry.resolve(&request.service).await?;

        let (first, cached, hybrid) = match descriptor.connection_method {
            ConnectionMethod::Disabled => {
                debug!("Refusing call to disabled service {}", request.service);
                return Err(RegistryError::ServiceDisabled {
                    service: request.service,
                    reason: descriptor
                        .disabled_reason
                        .unwrap_or_else(|| DEFAULT_DISABLED_REASON.to_string()),
                });
            }
            ConnectionMethod::Router => (ResolvedMethod::Router, false, false),
            ConnectionMethod::Rest => (ResolvedMethod::Rest, false, false),
            ConnectionMethod::Hybrid => {
                let request_bytes = serde_json::to_vec(&request.args)
                    .map(|bytes| bytes.len())
                    .map_err(|e| RegistryError::validation("args", e.to_string()))?;
                let (method, cached) =
                    self.decision
                        .decide(&request.service, request_bytes, request.priority);
                (method, cached, true)
            }
        };

        let instance = self.load_balancer.select_instance(&request.service)?;
        let decided_at = Utc::now();

        let first_error = match self.attempt(first, &instance, &request).await {
            Ok(value) => {
                return Ok(CallResponse {
                    value,
                    decision: ConnectionDecision {
                        method: first,
                        instance_id: instance.id,
                        decided_at,
                        cached,
                    },
                    fell_back: false,
                })
            }
            Err(e) => e,
        };

        let mut attempts = vec![AttemptFailure {
            method: first,
            instance_id: Some(instance.id),
            error: first_error.to_string(),
        }];

        if !hybrid {
            warn!(
                "Call {}.{} over {} failed: {}",
                request.service, request.method, first, first_error
            );
            return Err(RegistryError::ServiceUnavailable {
                service: request.service,
                attempts,
            });
        }

        let fallback = first.other();
        warn!(
            "Call {}.{} over {} failed ({}), falling back to {}",
            request.service, request.method, first, first_error, fallback
        );

        match self.attempt(fallback, &instance, &request).await {
            Ok(value) => Ok(CallResponse {
                value,
                decision: ConnectionDecision {
                    method: fallback,
                    instance_id: instance.id,
                    decided_at,
                    cached: false,
                },
                fell_back: true,
            }),
            Err(e) => {
                attempts.push(AttemptFailure {
                    method: fallback,
                    instance_id: Some(instance.id),
                    error: e.to_string(),
                });
                Err(RegistryError::ServiceUnavailable {
                    service: request.service,
                    attempts,
                })
            }
        }
    }

    async fn attempt(
        &self,
        method: ResolvedMethod,
        instance: &ServiceInstance,
        request: &CallRequest,
    ) -> std::result::Result<Value, TransportError> {
        let started = Instant::now();

        let result = match method {
            ResolvedMethod::Router => {
                self.router
                    .invoke(&request.service, &request.method, &request.args)
            }
            ResolvedMethod::Rest => {
                let timeout = self.config.request_timeout();
                match tokio::time::timeout(
                    timeout,
                    self.rest
                        .invoke(instance, &request.method, &request.args, timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(timeout)),
                }
            }
        };

        let outcome = match &result {
            // Nothing was contacted when the service is not mounted here
            Err(TransportError::NotMounted(_)) => None,
            // The endpoint answered; the caller asked for something it does not serve
            Ok(_) | Err(TransportError::MethodNotFound(_)) => Some(Ok(())),
            Err(e) => Some(Err(e.to_string())),
        };
        if let Some(outcome) = outcome {
            self.health.record_call(instance.id, started.elapsed(), outcome);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HybridRegistryConfig;
    use crate::health::{HealthReport, MockProber};
    use crate::models::{InstanceStatus, ServiceDescriptor};
    use crate::registry::MockServiceRegistry;
    use crate::transport::{MockRestTransport, MockRouterTransport};
    use serde_json::json;

    struct Harness {
        health: Arc<HealthMonitor>,
        load_balancer: Arc<LoadBalancer>,
        config: HybridRegistryConfig,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = HybridRegistryConfig::in_memory();
            config.health.enabled = false;
            let health = Arc::new(HealthMonitor::new(
                Arc::new(config.clone()),
                Arc::new(MockProber::new()),
            ));
            let load_balancer = Arc::new(LoadBalancer::new(
                config.load_balancer.clone(),
                Arc::clone(&health),
            ));
            Self {
                health,
                load_balancer,
                config,
            }
        }

        fn healthy_instance(&self, service: &str) -> ServiceInstance {
            let instance = ServiceInstance::new(service, "localhost", 9000);
            self.health.track(instance.clone(), ConnectionMethod::Hybrid);
            self.load_balancer.add_instance(instance.clone());
            self.health.record_report(
                instance.id,
                HealthReport {
                    score: 0.95,
                    latency_ms: Some(5.0),
                    load: Some(0.1),
                },
            );
            instance
        }

        fn proxy(
            &self,
            descriptor: ServiceDescriptor,
            router: MockRouterTransport,
            rest: MockRestTransport,
        ) -> ServiceProxy {
            let mut registry = MockServiceRegistry::new();
            registry
                .expect_resolve()
                .returning(move |_| Ok(descriptor.clone()));

            let router: Arc<dyn RouterTransport> = Arc::new(router);
            let decision = Arc::new(DecisionEngine::new(
                self.config.decision.clone(),
                Arc::clone(&self.health),
                Arc::clone(&router),
            ));

            ServiceProxy::new(
                self.config.proxy.clone(),
                Arc::new(registry),
                decision,
                Arc::clone(&self.load_balancer),
                Arc::clone(&self.health),
                router,
                Arc::new(rest),
            )
        }
    }

    #[tokio::test]
    async fn test_disabled_service_touches_no_transport() {
        let harness = Harness::new();
        harness.healthy_instance("billing");

        let mut router = MockRouterTransport::new();
        router.expect_invoke().never();
        router.expect_is_mounted().never();
        let mut rest = MockRestTransport::new();
        rest.expect_invoke().never();

        let mut descriptor = ServiceDescriptor::new("billing", ConnectionMethod::Disabled);
        descriptor.disabled_reason = Some("ledger migration".to_string());
        let proxy = harness.proxy(descriptor, router, rest);

        let err = proxy.call("billing", "charge", json!({})).await.unwrap_err();
        match err {
            RegistryError::ServiceDisabled { service, reason } => {
                assert_eq!(service, "billing");
                assert_eq!(reason, "ledger migration");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_without_reason_uses_default() {
        let harness = Harness::new();
        let proxy = harness.proxy(
            ServiceDescriptor::new("billing", ConnectionMethod::Disabled),
            MockRouterTransport::new(),
            MockRestTransport::new(),
        );

        let err = proxy.call("billing", "charge", json!({})).await.unwrap_err();
        assert!(err.to_string().contains(DEFAULT_DISABLED_REASON));
    }

    #[tokio::test]
    async fn test_rest_failure_has_no_fallback() {
        let harness = Harness::new();
        let instance = harness.healthy_instance("pricing");

        let mut router = MockRouterTransport::new();
        router.expect_invoke().never();
        let mut rest = MockRestTransport::new();
        rest.expect_invoke()
            .times(1)
            .returning(|_, _, _, _| Err(TransportError::Connection("refused".to_string())));

        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Rest),
            router,
            rest,
        );

        let err = proxy.call("pricing", "quote", json!({})).await.unwrap_err();
        match err {
            RegistryError::ServiceUnavailable { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].method, ResolvedMethod::Rest);
                assert_eq!(attempts[0].instance_id, Some(instance.id));
            }
            other => panic!("unexpected error: {other}"),
        }

        let snapshot = harness.health.snapshot(instance.id).unwrap();
        assert_eq!(snapshot.health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_router_call_dispatches_in_process() {
        let harness = Harness::new();
        harness.healthy_instance("pricing");

        let mut router = MockRouterTransport::new();
        router
            .expect_invoke()
            .times(1)
            .returning(|service, method, _| Ok(json!({"service": service, "method": method, "price": 42})));
        let mut rest = MockRestTransport::new();
        rest.expect_invoke().never();

        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Router),
            router,
            rest,
        );

        let response = proxy
            .call_with(CallRequest::new("pricing", "quote", json!({"sku": "A-1"})))
            .await
            .unwrap();
        assert_eq!(
            response.value,
            json!({"service": "pricing", "method": "quote", "price": 42})
        );
        assert_eq!(response.decision.method, ResolvedMethod::Router);
        assert!(!response.fell_back);
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_from_router_to_rest() {
        let harness = Harness::new();
        harness.healthy_instance("pricing");

        let mut router = MockRouterTransport::new();
        router.expect_is_mounted().return_const(true);
        router
            .expect_invoke()
            .times(1)
            .returning(|_, _, _| Err(TransportError::Handler("boom".to_string())));
        let mut rest = MockRestTransport::new();
        rest.expect_invoke()
            .times(1)
            .returning(|_, _, _, _| Ok(json!({"price": 41})));

        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Hybrid),
            router,
            rest,
        );

        let response = proxy
            .call_with(CallRequest::new("pricing", "quote", json!({})))
            .await
            .unwrap();
        assert_eq!(response.value, json!({"price": 41}));
        assert_eq!(response.decision.method, ResolvedMethod::Rest);
        assert!(response.fell_back);
    }

    #[tokio::test]
    async fn test_hybrid_both_paths_failing_reports_both() {
        let harness = Harness::new();
        harness.healthy_instance("pricing");

        let mut router = MockRouterTransport::new();
        router.expect_is_mounted().return_const(true);
        router
            .expect_invoke()
            .times(1)
            .returning(|_, _, _| Err(TransportError::Handler("boom".to_string())));
        let mut rest = MockRestTransport::new();
        rest.expect_invoke()
            .times(1)
            .returning(|_, _, _, _| Err(TransportError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            }));

        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Hybrid),
            router,
            rest,
        );

        let err = proxy.call("pricing", "quote", json!({})).await.unwrap_err();
        match err {
            RegistryError::ServiceUnavailable { attempts, .. } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].method, ResolvedMethod::Router);
                assert!(attempts[0].error.contains("boom"));
                assert_eq!(attempts[1].method, ResolvedMethod::Rest);
                assert!(attempts[1].error.contains("502"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_does_not_degrade_instance() {
        let harness = Harness::new();
        let instance = harness.healthy_instance("pricing");

        let mut router = MockRouterTransport::new();
        router
            .expect_invoke()
            .times(6)
            .returning(|_, method, _| Err(TransportError::MethodNotFound(method.to_string())));

        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Router),
            router,
            MockRestTransport::new(),
        );

        for _ in 0..6 {
            let err = proxy.call("pricing", "refund", json!({})).await.unwrap_err();
            assert!(matches!(err, RegistryError::ServiceUnavailable { .. }));
        }

        let snapshot = harness.health.snapshot(instance.id).unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Running);
        assert_eq!(snapshot.health.consecutive_failures, 0);
        assert_eq!(harness.load_balancer.select_instance("pricing").unwrap().id, instance.id);
    }

    #[tokio::test]
    async fn test_no_healthy_instance_stops_before_any_attempt() {
        let harness = Harness::new();
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        harness.health.track(instance.clone(), ConnectionMethod::Rest);
        harness.load_balancer.add_instance(instance);

        let mut rest = MockRestTransport::new();
        rest.expect_invoke().never();
        let proxy = harness.proxy(
            ServiceDescriptor::new("pricing", ConnectionMethod::Rest),
            MockRouterTransport::new(),
            rest,
        );

        let err = proxy.call("pricing", "quote", json!({})).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoHealthyInstances(_)));
    }
}
