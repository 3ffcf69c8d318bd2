//! Health Monitoring Module
//!
//! Tracks the health of every registered instance. Each instance gets its own
//! supervised probe task; probes and proxy call outcomes feed the same state
//! machine:
//!
//! ```text
//! Starting --success--> Running --failure--> Degraded --N failures--> Unhealthy
//!                          ^                    |                        |
//!                          +------success-------+--------success---------+
//! ```
//!
//! An instance that stays unhealthy for the eviction window without a single
//! success is reported on the eviction channel so the registry can deregister it.
//! `Stopped` is terminal.

use crate::config::{HealthConfig, HybridRegistryConfig};
use crate::models::{ConnectionMethod, HealthSample, HealthStatus, InstanceStatus, ServiceInstance};
use crate::transport::{RestTransport, RouterTransport};
use crate::utils::clamp_unit;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one liveness probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency: Duration,
    pub load: Option<f64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
            load: None,
            error: None,
        }
    }

    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency,
            load: None,
            error: Some(error.into()),
        }
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = Some(load);
        self
    }
}

/// Liveness check for one instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, instance: &ServiceInstance, method: ConnectionMethod) -> ProbeOutcome;
}

/// Probes through the same transports the proxy uses
pub struct TransportProber {
    router: Arc<dyn RouterTransport>,
    rest: Arc<dyn RestTransport>,
    timeout: Duration,
}

impl TransportProber {
    pub fn new(router: Arc<dyn RouterTransport>, rest: Arc<dyn RestTransport>, timeout: Duration) -> Self {
        Self {
            router,
            rest,
            timeout,
        }
    }

    fn probe_in_process(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let started = Instant::now();
        if self.router.is_callable(&instance.service_name) {
            // A callable handler that does not track load counts as idle
            let load = self.router.load(&instance.service_name).unwrap_or(0.0);
            ProbeOutcome::healthy(started.elapsed()).with_load(load)
        } else {
            ProbeOutcome::failed(
                started.elapsed(),
                format!("service {} is not callable in-process", instance.service_name),
            )
        }
    }

    async fn probe_http(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let started = Instant::now();
        match self.rest.probe(instance, self.timeout).await {
            Ok(response) if response.healthy => {
                let outcome = ProbeOutcome::healthy(started.elapsed());
                match response.load {
                    Some(load) => outcome.with_load(load),
                    None => outcome,
                }
            }
            Ok(response) => ProbeOutcome::failed(
                started.elapsed(),
                response
                    .detail
                    .unwrap_or_else(|| "instance reported unhealthy".to_string()),
            ),
            Err(e) => ProbeOutcome::failed(started.elapsed(), e.to_string()),
        }
    }
}

#[async_trait]
impl Prober for TransportProber {
    async fn probe(&self, instance: &ServiceInstance, method: ConnectionMethod) -> ProbeOutcome {
        match method {
            ConnectionMethod::Router => self.probe_in_process(instance),
            ConnectionMethod::Hybrid if self.router.is_mounted(&instance.service_name) => {
                self.probe_in_process(instance)
            }
            ConnectionMethod::Hybrid | ConnectionMethod::Rest | ConnectionMethod::Disabled => {
                self.probe_http(instance).await
            }
        }
    }
}

/// Health telemetry pushed by an instance or an operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// Health score in [0, 1]; 0 counts as a failure
    pub score: f64,
    pub latency_ms: Option<f64>,
    pub load: Option<f64>,
}

/// Request from the monitor to deregister an instance
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionNotice {
    pub service_name: String,
    pub instance_id: Uuid,
}

/// Read-only view of one instance
#[derive(Debug, Clone)]
pub struct InstanceHealthSnapshot {
    pub instance: ServiceInstance,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    /// Whether the last observation is within the telemetry staleness window
    pub fresh: bool,
}

/// Aggregate health of one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    /// Mean score of instances with fresh telemetry, 0.0 without any
    pub score: f64,
    /// Mean reported load of fresh instances, 1.0 without any report
    pub load: f64,
    pub latency_ms: Option<f64>,
    pub last_check: Option<chrono::DateTime<Utc>>,
    /// Whether any instance contributed fresh telemetry
    pub has_telemetry: bool,
}

impl ServiceHealth {
    fn unknown() -> Self {
        Self {
            score: 0.0,
            load: 1.0,
            latency_ms: None,
            last_check: None,
            has_telemetry: false,
        }
    }
}

/// Health monitoring statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitoringStats {
    pub monitored_instances: u64,
    pub running_instances: u64,
    pub degraded_instances: u64,
    pub unhealthy_instances: u64,
    pub total_probes: u64,
    pub failed_probes: u64,
}

enum Observation {
    Success {
        latency_ms: f64,
        score: f64,
        load: Option<f64>,
    },
    Failure {
        latency_ms: Option<f64>,
        error: String,
    },
}

struct HealthRecord {
    status: InstanceStatus,
    health: HealthStatus,
    history: VecDeque<HealthSample>,
    last_success: Option<Instant>,
    last_observation: Option<Instant>,
    tracked_since: Instant,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: InstanceStatus::Starting,
            health: HealthStatus::default(),
            history: VecDeque::new(),
            last_success: None,
            last_observation: None,
            tracked_since: Instant::now(),
        }
    }

    /// Apply one observation, returning the status transition if any
    fn apply(
        &mut self,
        observation: Observation,
        config: &HealthConfig,
    ) -> Option<(InstanceStatus, InstanceStatus)> {
        if matches!(self.status, InstanceStatus::Stopped | InstanceStatus::Draining) {
            return None;
        }

        let previous = self.status;
        let now = Instant::now();

        let (success, latency_ms) = match observation {
            Observation::Success {
                latency_ms,
                score,
                load,
            } => {
                self.health.is_healthy = true;
                self.health.score = clamp_unit(score);
                self.health.latency_ms = Some(latency_ms);
                self.health.consecutive_failures = 0;
                self.health.error = None;
                if let Some(load) = load {
                    self.health.load = Some(clamp_unit(load));
                }
                self.last_success = Some(now);
                self.status = InstanceStatus::Running;
                (true, Some(latency_ms))
            }
            Observation::Failure { latency_ms, error } => {
                self.health.consecutive_failures += 1;
                self.health.error = Some(error);
                if latency_ms.is_some() {
                    self.health.latency_ms = latency_ms;
                }

                if self.health.consecutive_failures >= config.failure_threshold {
                    self.status = InstanceStatus::Unhealthy;
                    self.health.is_healthy = false;
                    self.health.score = 0.0;
                } else if self.status == InstanceStatus::Starting {
                    self.health.is_healthy = false;
                    self.health.score = 0.0;
                } else {
                    self.status = InstanceStatus::Degraded;
                    self.health.score = clamp_unit(self.health.score * config.degraded_decay);
                }
                (false, latency_ms)
            }
        };

        self.health.last_check = Some(Utc::now());
        self.last_observation = Some(now);

        self.history.push_back(HealthSample {
            timestamp: Utc::now(),
            success,
            latency_ms,
            score: if success { self.health.score } else { 0.0 },
        });
        while self.history.len() > config.history_size {
            self.history.pop_front();
        }

        (previous != self.status).then_some((previous, self.status))
    }

    fn is_fresh(&self, staleness: Duration) -> bool {
        self.last_observation
            .map(|at| at.elapsed() <= staleness)
            .unwrap_or(false)
    }

    fn should_evict(&self, window: Duration) -> bool {
        self.status == InstanceStatus::Unhealthy
            && self.last_success.unwrap_or(self.tracked_since).elapsed() >= window
    }
}

struct InstanceHealth {
    instance: ServiceInstance,
    method: RwLock<ConnectionMethod>,
    record: Mutex<HealthRecord>,
    cancel: CancellationToken,
}

impl InstanceHealth {
    fn method(&self) -> ConnectionMethod {
        *self.method.read()
    }

    fn observe(&self, observation: Observation, config: &HealthConfig) {
        let transition = self.record.lock().apply(observation, config);
        if let Some((from, to)) = transition {
            log_transition(&self.instance, from, to);
        }
    }

    fn snapshot(&self, staleness: Duration) -> InstanceHealthSnapshot {
        let record = self.record.lock();
        InstanceHealthSnapshot {
            instance: self.instance.clone(),
            status: record.status,
            health: record.health.clone(),
            fresh: record.is_fresh(staleness),
        }
    }
}

fn log_transition(instance: &ServiceInstance, from: InstanceStatus, to: InstanceStatus) {
    match to {
        InstanceStatus::Unhealthy => warn!(
            "Instance {} of {} ({}) is unhealthy",
            instance.id,
            instance.service_name,
            instance.address()
        ),
        InstanceStatus::Degraded => warn!(
            "Instance {} of {} degraded ({} -> {})",
            instance.id, instance.service_name, from, to
        ),
        _ => info!(
            "Instance {} of {} is {} (was {})",
            instance.id, instance.service_name, to, from
        ),
    }
}

fn latency_score(latency_ms: f64, baseline_ms: f64) -> f64 {
    if latency_ms <= baseline_ms {
        1.0
    } else {
        baseline_ms / latency_ms
    }
}

#[derive(Default)]
struct ProbeCounters {
    total: AtomicU64,
    failed: AtomicU64,
}

/// Per-instance health tracking with supervised probe tasks
pub struct HealthMonitor {
    config: Arc<HybridRegistryConfig>,
    prober: Arc<dyn Prober>,
    instances: DashMap<Uuid, Arc<InstanceHealth>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    evictions: mpsc::UnboundedSender<EvictionNotice>,
    eviction_rx: Mutex<Option<mpsc::UnboundedReceiver<EvictionNotice>>>,
    counters: Arc<ProbeCounters>,
}

impl HealthMonitor {
    pub fn new(config: Arc<HybridRegistryConfig>, prober: Arc<dyn Prober>) -> Self {
        let (evictions, eviction_rx) = mpsc::unbounded_channel();
        Self {
            config,
            prober,
            instances: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            evictions,
            eviction_rx: Mutex::new(Some(eviction_rx)),
            counters: Arc::new(ProbeCounters::default()),
        }
    }

    /// Receiver of eviction notices; can be taken once
    pub fn take_eviction_receiver(&self) -> Option<mpsc::UnboundedReceiver<EvictionNotice>> {
        self.eviction_rx.lock().take()
    }

    /// Start tracking an instance. Tracking an already tracked instance only updates its method.
    pub fn track(&self, instance: ServiceInstance, method: ConnectionMethod) {
        if let Some(existing) = self.instances.get(&instance.id) {
            *existing.method.write() = method;
            return;
        }

        let entry = Arc::new(InstanceHealth {
            instance,
            method: RwLock::new(method),
            record: Mutex::new(HealthRecord::new()),
            cancel: self.shutdown.child_token(),
        });
        let instance_id = entry.instance.id;
        self.instances.insert(instance_id, Arc::clone(&entry));

        if self.config.health.enabled && !self.shutdown.is_cancelled() {
            self.tracker.spawn(run_probe_loop(
                entry,
                Arc::clone(&self.prober),
                Arc::clone(&self.config),
                self.evictions.clone(),
                Arc::clone(&self.counters),
            ));
        }

        debug!("Tracking health of instance {}", instance_id);
    }

    /// Stop tracking an instance and cancel its probe task
    pub fn untrack(&self, instance_id: Uuid) -> bool {
        match self.instances.remove(&instance_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                entry.record.lock().status = InstanceStatus::Stopped;
                debug!("Stopped tracking instance {}", instance_id);
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, instance_id: Uuid) -> bool {
        self.instances.contains_key(&instance_id)
    }

    /// Update the probe method of every instance of a service
    pub fn set_service_method(&self, service_name: &str, method: ConnectionMethod) {
        for entry in self.instances.iter() {
            if entry.instance.service_name == service_name {
                *entry.method.write() = method;
            }
        }
    }

    /// Feedback from a proxied call
    pub fn record_call(&self, instance_id: Uuid, latency: Duration, result: Result<(), String>) {
        let Some(entry) = self.entry(instance_id) else {
            return;
        };

        let latency_ms = latency.as_secs_f64() * 1000.0;
        let observation = match result {
            Ok(()) => Observation::Success {
                latency_ms,
                score: latency_score(latency_ms, self.config.health.baseline_latency_ms),
                load: None,
            },
            Err(error) => Observation::Failure {
                latency_ms: Some(latency_ms),
                error,
            },
        };
        entry.observe(observation, &self.config.health);
    }

    /// Apply a probe outcome obtained outside the probe loop
    pub fn record_probe(&self, instance_id: Uuid, outcome: ProbeOutcome) {
        if let Some(entry) = self.entry(instance_id) {
            entry.observe(
                observation_from_probe(outcome, &self.config.health),
                &self.config.health,
            );
        }
    }

    /// Apply pushed telemetry
    pub fn record_report(&self, instance_id: Uuid, report: HealthReport) -> bool {
        let Some(entry) = self.entry(instance_id) else {
            return false;
        };

        let observation = if report.score > 0.0 {
            Observation::Success {
                latency_ms: report.latency_ms.unwrap_or(0.0),
                score: report.score,
                load: report.load,
            }
        } else {
            Observation::Failure {
                latency_ms: report.latency_ms,
                error: "instance reported zero health".to_string(),
            }
        };
        entry.observe(observation, &self.config.health);
        true
    }

    /// Probe an instance immediately
    pub async fn check_now(&self, instance_id: Uuid) -> Option<InstanceHealthSnapshot> {
        let entry = self.entry(instance_id)?;
        let outcome = probe_with_timeout(&*self.prober, &entry, &self.config.health).await;
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if !outcome.success {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        entry.observe(
            observation_from_probe(outcome, &self.config.health),
            &self.config.health,
        );
        Some(entry.snapshot(self.config.health.telemetry_staleness()))
    }

    pub fn snapshot(&self, instance_id: Uuid) -> Option<InstanceHealthSnapshot> {
        self.entry(instance_id)
            .map(|entry| entry.snapshot(self.config.health.telemetry_staleness()))
    }

    pub fn history(&self, instance_id: Uuid) -> Vec<HealthSample> {
        self.entry(instance_id)
            .map(|entry| entry.record.lock().history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshots of every tracked instance of a service
    pub fn service_snapshots(&self, service_name: &str) -> Vec<InstanceHealthSnapshot> {
        let staleness = self.config.health.telemetry_staleness();
        let mut snapshots: Vec<InstanceHealthSnapshot> = self
            .instances
            .iter()
            .filter(|entry| entry.instance.service_name == service_name)
            .map(|entry| entry.snapshot(staleness))
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.instance.registered_at);
        snapshots
    }

    /// Aggregate health of a service; missing telemetry reads as health 0.0, load 1.0
    pub fn service_health(&self, service_name: &str) -> ServiceHealth {
        let fresh: Vec<InstanceHealthSnapshot> = self
            .service_snapshots(service_name)
            .into_iter()
            .filter(|s| s.fresh && !matches!(s.status, InstanceStatus::Stopped | InstanceStatus::Draining))
            .collect();

        if fresh.is_empty() {
            return ServiceHealth::unknown();
        }

        let count = fresh.len() as f64;
        let score = fresh.iter().map(|s| s.health.score).sum::<f64>() / count;

        let loads: Vec<f64> = fresh.iter().filter_map(|s| s.health.load).collect();
        let load = if loads.is_empty() {
            1.0
        } else {
            loads.iter().sum::<f64>() / loads.len() as f64
        };

        let latencies: Vec<f64> = fresh.iter().filter_map(|s| s.health.latency_ms).collect();
        let latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        ServiceHealth {
            score,
            load,
            latency_ms,
            last_check: fresh.iter().filter_map(|s| s.health.last_check).max(),
            has_telemetry: true,
        }
    }

    pub fn stats(&self) -> HealthMonitoringStats {
        let mut stats = HealthMonitoringStats {
            monitored_instances: 0,
            running_instances: 0,
            degraded_instances: 0,
            unhealthy_instances: 0,
            total_probes: self.counters.total.load(Ordering::Relaxed),
            failed_probes: self.counters.failed.load(Ordering::Relaxed),
        };

        for entry in self.instances.iter() {
            stats.monitored_instances += 1;
            match entry.record.lock().status {
                InstanceStatus::Running => stats.running_instances += 1,
                InstanceStatus::Degraded => stats.degraded_instances += 1,
                InstanceStatus::Unhealthy => stats.unhealthy_instances += 1,
                _ => {}
            }
        }

        stats
    }

    /// Cancel every probe task and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Health monitor stopped");
    }

    fn entry(&self, instance_id: Uuid) -> Option<Arc<InstanceHealth>> {
        self.instances
            .get(&instance_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

fn observation_from_probe(outcome: ProbeOutcome, config: &HealthConfig) -> Observation {
    let latency_ms = outcome.latency.as_secs_f64() * 1000.0;
    if outcome.success {
        Observation::Success {
            latency_ms,
            score: latency_score(latency_ms, config.baseline_latency_ms),
            load: outcome.load,
        }
    } else {
        Observation::Failure {
            latency_ms: Some(latency_ms),
            error: outcome
                .error
                .unwrap_or_else(|| "health probe failed".to_string()),
        }
    }
}

async fn probe_with_timeout(
    prober: &dyn Prober,
    entry: &InstanceHealth,
    config: &HealthConfig,
) -> ProbeOutcome {
    let timeout = config.probe_timeout();
    match tokio::time::timeout(timeout, prober.probe(&entry.instance, entry.method())).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::failed(timeout, format!("health probe timed out after {:?}", timeout)),
    }
}

async fn run_probe_loop(
    entry: Arc<InstanceHealth>,
    prober: Arc<dyn Prober>,
    config: Arc<HybridRegistryConfig>,
    evictions: mpsc::UnboundedSender<EvictionNotice>,
    counters: Arc<ProbeCounters>,
) {
    let health = &config.health;

    loop {
        let outcome = tokio::select! {
            _ = entry.cancel.cancelled() => break,
            outcome = probe_with_timeout(&*prober, &entry, health) => outcome,
        };

        counters.total.fetch_add(1, Ordering::Relaxed);
        if !outcome.success {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        entry.observe(observation_from_probe(outcome, health), health);

        let (evict, failing) = {
            let record = entry.record.lock();
            (
                record.should_evict(health.eviction_window()),
                record.health.consecutive_failures > 0,
            )
        };

        if evict {
            warn!(
                "Instance {} of {} unhealthy for {:?}, requesting deregistration",
                entry.instance.id,
                entry.instance.service_name,
                health.eviction_window()
            );
            let _ = evictions.send(EvictionNotice {
                service_name: entry.instance.service_name.clone(),
                instance_id: entry.instance.id,
            });
            break;
        }

        let delay = if failing {
            health.retry_interval()
        } else {
            health.interval()
        };

        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("Probe loop for instance {} finished", entry.instance.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    fn test_config() -> Arc<HybridRegistryConfig> {
        Arc::new(HybridRegistryConfig::in_memory())
    }

    /// Prober whose answer can be flipped during a test
    struct SwitchProber {
        healthy: AtomicBool,
        calls: AtomicU64,
    }

    impl SwitchProber {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Prober for SwitchProber {
        async fn probe(&self, _instance: &ServiceInstance, _method: ConnectionMethod) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                ProbeOutcome::healthy(Duration::from_millis(20))
            } else {
                ProbeOutcome::failed(Duration::from_millis(20), "connection refused")
            }
        }
    }

    fn idle_monitor() -> HealthMonitor {
        let mut config = HybridRegistryConfig::in_memory();
        config.health.enabled = false;
        HealthMonitor::new(Arc::new(config), SwitchProber::new(true))
    }

    #[test]
    fn test_state_machine_transitions() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new();
        assert_eq!(record.status, InstanceStatus::Starting);

        let success = || Observation::Success {
            latency_ms: 50.0,
            score: 1.0,
            load: None,
        };
        let failure = || Observation::Failure {
            latency_ms: None,
            error: "refused".to_string(),
        };

        assert_eq!(
            record.apply(success(), &config),
            Some((InstanceStatus::Starting, InstanceStatus::Running))
        );

        assert_eq!(
            record.apply(failure(), &config),
            Some((InstanceStatus::Running, InstanceStatus::Degraded))
        );
        assert!(record.health.is_healthy);
        assert_eq!(record.health.score, 0.75);

        for _ in 0..3 {
            record.apply(failure(), &config);
        }
        assert_eq!(record.status, InstanceStatus::Degraded);
        assert_eq!(record.health.consecutive_failures, 4);

        assert_eq!(
            record.apply(failure(), &config),
            Some((InstanceStatus::Degraded, InstanceStatus::Unhealthy))
        );
        assert!(!record.health.is_healthy);
        assert_eq!(record.health.score, 0.0);

        assert_eq!(
            record.apply(success(), &config),
            Some((InstanceStatus::Unhealthy, InstanceStatus::Running))
        );
        assert_eq!(record.health.consecutive_failures, 0);
    }

    #[test]
    fn test_starting_instance_failures_stay_unhealthy_scored() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new();
        record.apply(
            Observation::Failure {
                latency_ms: None,
                error: "refused".to_string(),
            },
            &config,
        );
        assert_eq!(record.status, InstanceStatus::Starting);
        assert!(!record.health.is_healthy);
        assert_eq!(record.health.score, 0.0);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let config = HealthConfig::default();
        let mut record = HealthRecord::new();
        record.status = InstanceStatus::Stopped;
        let transition = record.apply(
            Observation::Success {
                latency_ms: 1.0,
                score: 1.0,
                load: None,
            },
            &config,
        );
        assert_eq!(transition, None);
        assert_eq!(record.status, InstanceStatus::Stopped);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = HealthConfig::default();
        config.history_size = 3;
        let mut record = HealthRecord::new();
        for _ in 0..10 {
            record.apply(
                Observation::Success {
                    latency_ms: 10.0,
                    score: 1.0,
                    load: None,
                },
                &config,
            );
        }
        assert_eq!(record.history.len(), 3);
    }

    #[test]
    fn test_latency_score() {
        assert_eq!(latency_score(20.0, 100.0), 1.0);
        assert_eq!(latency_score(200.0, 100.0), 0.5);
        assert_eq!(latency_score(0.0, 100.0), 1.0);
    }

    #[test]
    fn test_missing_telemetry_reads_as_unhealthy_and_loaded() {
        let monitor = idle_monitor();
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance, ConnectionMethod::Hybrid);

        let health = monitor.service_health("pricing");
        assert!(!health.has_telemetry);
        assert_eq!(health.score, 0.0);
        assert_eq!(health.load, 1.0);
        assert_eq!(monitor.service_health("unknown").load, 1.0);
    }

    #[test]
    fn test_reports_drive_aggregate_health() {
        let monitor = idle_monitor();
        let a = ServiceInstance::new("pricing", "localhost", 9000);
        let b = ServiceInstance::new("pricing", "localhost", 9001);
        monitor.track(a.clone(), ConnectionMethod::Hybrid);
        monitor.track(b.clone(), ConnectionMethod::Hybrid);

        monitor.record_report(
            a.id,
            HealthReport {
                score: 0.9,
                latency_ms: Some(10.0),
                load: Some(0.2),
            },
        );
        monitor.record_report(
            b.id,
            HealthReport {
                score: 0.7,
                latency_ms: Some(30.0),
                load: Some(0.4),
            },
        );

        let health = monitor.service_health("pricing");
        assert!(health.has_telemetry);
        assert!((health.score - 0.8).abs() < 1e-9);
        assert!((health.load - 0.3).abs() < 1e-9);
        assert_eq!(health.latency_ms, Some(20.0));
    }

    #[test]
    fn test_record_call_feeds_failure_counter() {
        let monitor = idle_monitor();
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance.clone(), ConnectionMethod::Rest);

        monitor.record_call(instance.id, Duration::from_millis(10), Ok(()));
        assert_eq!(
            monitor.snapshot(instance.id).unwrap().status,
            InstanceStatus::Running
        );

        for _ in 0..5 {
            monitor.record_call(
                instance.id,
                Duration::from_millis(10),
                Err("timeout".to_string()),
            );
        }
        let snapshot = monitor.snapshot(instance.id).unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Unhealthy);
        assert_eq!(snapshot.health.consecutive_failures, 5);
        assert_eq!(monitor.history(instance.id).len(), 6);
    }

    #[test]
    fn test_untrack_is_idempotent() {
        let monitor = idle_monitor();
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance.clone(), ConnectionMethod::Rest);
        assert!(monitor.untrack(instance.id));
        assert!(!monitor.untrack(instance.id));
        assert!(monitor.snapshot(instance.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_marks_running_then_unhealthy() {
        let prober = SwitchProber::new(true);
        let monitor = HealthMonitor::new(test_config(), prober.clone());
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance.clone(), ConnectionMethod::Rest);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            monitor.snapshot(instance.id).unwrap().status,
            InstanceStatus::Running
        );

        prober.healthy.store(false, Ordering::SeqCst);
        // One 30s interval then four 10s retries
        tokio::time::sleep(Duration::from_secs(30 + 4 * 10 + 1)).await;

        let snapshot = monitor.snapshot(instance.id).unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Unhealthy);
        assert_eq!(snapshot.health.score, 0.0);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_instance_is_evicted_after_window() {
        let prober = SwitchProber::new(false);
        let monitor = HealthMonitor::new(test_config(), prober);
        let mut evictions = monitor.take_eviction_receiver().unwrap();
        assert!(monitor.take_eviction_receiver().is_none());

        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance.clone(), ConnectionMethod::Rest);

        let notice = tokio::time::timeout(Duration::from_secs(700), evictions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.instance_id, instance.id);
        assert_eq!(notice.service_name, "pricing");

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_probing() {
        let prober = SwitchProber::new(true);
        let monitor = HealthMonitor::new(test_config(), prober.clone());
        monitor.track(
            ServiceInstance::new("pricing", "localhost", 9000),
            ConnectionMethod::Rest,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        monitor.shutdown().await;
        let calls = prober.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(prober.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_in_process_probe_reports_load() {
        use crate::transport::{InProcessRouter, MockRestTransport, RouteHandler, TransportError};
        use serde_json::Value;

        struct Busy;

        impl RouteHandler for Busy {
            fn handle(&self, _method: &str, _args: &Value) -> Result<Value, TransportError> {
                Ok(Value::Null)
            }

            fn load(&self) -> Option<f64> {
                Some(0.3)
            }
        }

        let router = Arc::new(InProcessRouter::new());
        router.mount(
            "pricing",
            Arc::new(|_: &str, _: &Value| -> Result<Value, TransportError> { Ok(Value::Null) }),
        );
        router.mount("billing", Arc::new(Busy));

        let mut rest = MockRestTransport::new();
        rest.expect_probe().never();
        let prober = TransportProber::new(router, Arc::new(rest), Duration::from_secs(1));

        let pricing = ServiceInstance::new("pricing", "localhost", 9000);
        let outcome = prober.probe(&pricing, ConnectionMethod::Hybrid).await;
        assert!(outcome.success);
        assert_eq!(outcome.load, Some(0.0));

        let billing = ServiceInstance::new("billing", "localhost", 9001);
        let outcome = prober.probe(&billing, ConnectionMethod::Router).await;
        assert_eq!(outcome.load, Some(0.3));
    }

    #[tokio::test]
    async fn test_check_now_uses_prober() {
        let mut prober = MockProber::new();
        prober
            .expect_probe()
            .times(1)
            .returning(|_, _| ProbeOutcome::healthy(Duration::from_millis(5)).with_load(0.4));

        let mut config = HybridRegistryConfig::in_memory();
        config.health.enabled = false;
        let monitor = HealthMonitor::new(Arc::new(config), Arc::new(prober));
        let instance = ServiceInstance::new("pricing", "localhost", 9000);
        monitor.track(instance.clone(), ConnectionMethod::Rest);

        let snapshot = monitor.check_now(instance.id).await.unwrap();
        assert_eq!(snapshot.status, InstanceStatus::Running);
        assert_eq!(snapshot.health.load, Some(0.4));
        assert_eq!(monitor.stats().total_probes, 1);
    }
}
