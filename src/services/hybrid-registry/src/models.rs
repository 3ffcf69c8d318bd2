//! Hybrid Registry Models
//!
//! Core data structures shared by the registry, the health monitor, the load
//! balancer and the proxy: service descriptors, instances, health records,
//! connection decisions and the admin-facing report types.

use crate::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// How calls to a service are dispatched
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    /// In-process invocation through the local router
    Router,
    /// HTTP request to a remote instance
    Rest,
    /// Decided per call by the decision engine, with one fallback
    Hybrid,
    /// Calls are refused
    Disabled,
}

impl ConnectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMethod::Router => "router",
            ConnectionMethod::Rest => "rest",
            ConnectionMethod::Hybrid => "hybrid",
            ConnectionMethod::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMethod {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "router" => Ok(ConnectionMethod::Router),
            "rest" => Ok(ConnectionMethod::Rest),
            "hybrid" => Ok(ConnectionMethod::Hybrid),
            "disabled" => Ok(ConnectionMethod::Disabled),
            other => Err(RegistryError::validation(
                "connection_method",
                format!(
                    "'{}' is not one of router, rest, hybrid, disabled",
                    other
                ),
            )),
        }
    }
}

/// A concrete transport chosen for one attempt. Never hybrid or disabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedMethod {
    Router,
    Rest,
}

impl ResolvedMethod {
    /// The method used for the hybrid fallback attempt
    pub fn other(self) -> Self {
        match self {
            ResolvedMethod::Router => ResolvedMethod::Rest,
            ResolvedMethod::Rest => ResolvedMethod::Router,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedMethod::Router => "router",
            ResolvedMethod::Rest => "rest",
        }
    }
}

impl fmt::Display for ResolvedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ResolvedMethod> for ConnectionMethod {
    fn from(method: ResolvedMethod) -> Self {
        match method {
            ResolvedMethod::Router => ConnectionMethod::Router,
            ResolvedMethod::Rest => ConnectionMethod::Rest,
        }
    }
}

/// Caller-supplied call priority
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// Lifecycle status of a service instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Registered, no successful probe yet
    Starting,
    /// Serving normally
    Running,
    /// Recent failures below the unhealthy threshold
    Degraded,
    /// Failure threshold reached, excluded from selection
    Unhealthy,
    /// Being taken out of rotation
    Draining,
    /// Deregistered, terminal
    Stopped,
}

impl InstanceStatus {
    /// Whether the load balancer may consider the instance at all
    pub fn is_selectable(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Draining => "draining",
            InstanceStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "degraded" => Ok(InstanceStatus::Degraded),
            "unhealthy" => Ok(InstanceStatus::Unhealthy),
            "draining" => Ok(InstanceStatus::Draining),
            "stopped" => Ok(InstanceStatus::Stopped),
            other => Err(RegistryError::validation(
                "status",
                format!("unknown instance status '{}'", other),
            )),
        }
    }
}

/// One logical service and its connection preference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDescriptor {
    /// Unique, immutable service name
    pub name: String,

    /// Connection method preference
    pub connection_method: ConnectionMethod,

    /// Reason reported to callers while the service is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// First registration timestamp
    pub registered_at: DateTime<Utc>,

    /// Last change to the descriptor
    pub updated_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, connection_method: ConnectionMethod) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            connection_method,
            disabled_reason: None,
            metadata: HashMap::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One running endpoint of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    /// Unique instance identifier
    pub id: Uuid,

    /// Owning service name
    pub service_name: String,

    /// Host the instance listens on
    pub host: String,

    /// Port the instance listens on
    pub port: u16,

    /// Health-check address; defaults to `http://host:port/health`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,

    /// Last persisted lifecycle status
    pub status: InstanceStatus,

    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            host: host.into(),
            port,
            health_check_url: None,
            status: InstanceStatus::Starting,
            registered_at: Utc::now(),
        }
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            format!("{}:{}", self.host.trim_end_matches('/'), self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn health_url(&self) -> String {
        self.health_check_url
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.base_url(), crate::health_check::DEFAULT_HTTP_PATH))
    }
}

/// Point-in-time health assessment of an instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    /// Whether the instance is currently considered healthy
    pub is_healthy: bool,

    /// Health score in [0, 1]; 0.0 whenever `is_healthy` is false
    pub score: f64,

    /// Last observed latency in milliseconds
    pub latency_ms: Option<f64>,

    /// Last observation time
    pub last_check: Option<DateTime<Utc>>,

    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Last error detail
    pub error: Option<String>,

    /// Fraction of capacity in use, as last reported
    pub load: Option<f64>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            is_healthy: false,
            score: 0.0,
            latency_ms: None,
            last_check: None,
            consecutive_failures: 0,
            error: None,
            load: None,
        }
    }
}

/// Entry in the bounded per-instance health history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub score: f64,
}

/// Outcome of the decision engine for one call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionDecision {
    /// Resolved transport
    pub method: ResolvedMethod,

    /// Instance the call is addressed to
    pub instance_id: Uuid,

    /// When the decision was taken
    pub decided_at: DateTime<Utc>,

    /// Whether the method came from the decision cache
    pub cached: bool,
}

/// One failed attempt, recorded without transport-specific types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptFailure {
    pub method: ResolvedMethod,
    pub instance_id: Option<Uuid>,
    pub error: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.method, self.error)
    }
}

/// A proxied call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub priority: CallPriority,
}

impl CallRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
            priority: CallPriority::default(),
        }
    }

    pub fn with_priority(mut self, priority: CallPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of a proxied call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub value: serde_json::Value,
    pub decision: ConnectionDecision,
    pub fell_back: bool,
}

/// Result of a connection method update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodChange {
    pub service: String,
    pub old_method: ConnectionMethod,
    pub new_method: ConnectionMethod,
    /// False when cache invalidation could not be confirmed
    pub cache_consistent: bool,
}

/// Aggregate service health state reported to administrators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
    Unknown,
}

/// Aggregated health numbers of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub score: f64,
    pub latency_ms: Option<f64>,
    pub load: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Per-instance detail in a status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub id: Uuid,
    pub address: String,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub selections: u64,
}

/// Answer of `get_service_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    pub service: String,
    pub status: ServiceHealthState,
    pub connection_method: ConnectionMethod,
    pub disabled_reason: Option<String>,
    pub health: HealthSummary,
    pub instances: Vec<InstanceReport>,
}

/// Row of `list_services`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub connection_method: ConnectionMethod,
    pub instance_count: usize,
    pub healthy_instances: usize,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters of one cache tier
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub size: Option<u64>,
}

impl TierStats {
    pub fn new(hits: u64, misses: u64, errors: u64, size: Option<u64>) -> Self {
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        Self {
            hits,
            misses,
            errors,
            hit_rate,
            size,
        }
    }
}

/// Answer of `get_cache_stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub local: TierStats,
    pub distributed: TierStats,
    pub durable_lookups: u64,
    pub stale_served: u64,
}

/// Service registration request body
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterServiceRequest {
    /// Service name (e.g., "pricing", "user_svc")
    #[validate(length(min = 1, max = 63))]
    pub name: String,

    /// One of router, rest, hybrid, disabled
    pub connection_method: String,

    /// Instance host
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Instance port
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Health-check address override
    pub health_check_url: Option<String>,

    /// Service metadata
    pub metadata: Option<HashMap<String, String>>,
}

impl RegisterServiceRequest {
    /// Validate and split into the descriptor and the first instance
    pub fn into_parts(self) -> Result<(ServiceDescriptor, ServiceInstance)> {
        self.validate()?;
        let method: ConnectionMethod = self.connection_method.parse()?;

        let descriptor =
            ServiceDescriptor::new(&self.name, method).with_metadata(self.metadata.unwrap_or_default());
        let mut instance = ServiceInstance::new(&self.name, self.host, self.port);
        instance.health_check_url = self.health_check_url;

        Ok((descriptor, instance))
    }
}

/// Connection method update request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConnectionMethodRequest {
    pub connection_method: String,
    pub reason: Option<String>,
}

/// Registration acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub service: String,
    pub instance_id: Uuid,
    pub cache_consistent: bool,
}
