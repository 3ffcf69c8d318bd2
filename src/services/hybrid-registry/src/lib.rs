//! Hybrid Registry Library
//!
//! Per-service hybrid connection registry.
//!
//! Every registered service carries a connection method preference that decides
//! how calls reach it:
//! - **router**: in-process invocation through the local router
//! - **rest**: HTTP request to a remote instance
//! - **hybrid**: decided per call from health, load, co-location, request size
//!   and priority, with exactly one fallback to the other method
//! - **disabled**: calls are refused without touching any transport
//!
//! # Features
//!
//! - **Tiered lookups**: local LRU cache → distributed cache (Redis) → durable store (PostgreSQL)
//! - **Zero-downtime reconfiguration**: connection method changes invalidate both cache tiers
//! - **Health monitoring**: supervised per-instance probe tasks with a failure state machine
//! - **Load balancing**: weighted random selection from health score, load and latency
//!
//! # Quick Start
//!
//! ```no_run
//! use hybrid_registry::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(HybridRegistryConfig::default());
//!     let router = Arc::new(InProcessRouter::new());
//!     let components = RegistryComponents::in_memory(config, router)?;
//!
//!     let descriptor = ServiceDescriptor::new("pricing", ConnectionMethod::Hybrid);
//!     let instance = ServiceInstance::new("pricing", "127.0.0.1", 9000);
//!     components.registry.register(descriptor, instance).await?;
//!
//!     let value = components
//!         .proxy
//!         .call("pricing", "quote", serde_json::json!({"sku": "A-1"}))
//!         .await?;
//!     println!("{}", value);
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod decision;
pub mod handlers;
pub mod health;
pub mod load_balancer;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheError, DistributedCache, InMemoryDistributedCache, LocalCache, RedisCache};
pub use config::{Args, HybridRegistryConfig};
pub use decision::{DecisionEngine, DecisionInput};
pub use health::{HealthMonitor, HealthReport, ProbeOutcome, Prober, TransportProber};
pub use load_balancer::LoadBalancer;
pub use models::{
    AttemptFailure, CacheStats, CallPriority, CallRequest, CallResponse, ConnectionDecision,
    ConnectionMethod, HealthStatus, InstanceStatus, MethodChange, RegisterServiceRequest,
    ResolvedMethod, ServiceDescriptor, ServiceInstance, ServiceStatusReport, ServiceSummary,
};
pub use proxy::ServiceProxy;
pub use registry::{RegistryComponents, ServiceRegistry, ServiceRegistryImpl};
pub use store::{DurableStore, InMemoryStore, PostgresStore, StoreError};
pub use transport::{
    HttpTransport, InProcessRouter, RestTransport, RouteHandler, RouterTransport, TransportError,
};

/// Hybrid registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Duplicate instance {address} for service {service}")]
    DuplicateInstance { service: String, address: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {service} is disabled: {reason}")]
    ServiceDisabled { service: String, reason: String },

    #[error("No healthy instances available for service: {0}")]
    NoHealthyInstances(String),

    #[error("Service {service} unavailable: {}", format_attempts(.attempts))]
    ServiceUnavailable {
        service: String,
        attempts: Vec<models::AttemptFailure>,
    },

    #[error("Cache connection error: {0}")]
    CacheConnection(String),

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_attempts(attempts: &[models::AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|attempt| attempt.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable error kind exposed to callers and the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    DuplicateInstance,
    ServiceNotFound,
    ServiceDisabled,
    NoHealthyInstances,
    ServiceUnavailable,
    CacheConnection,
    StoreUnavailable,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::DuplicateInstance => "duplicate_instance",
            ErrorKind::ServiceNotFound => "service_not_found",
            ErrorKind::ServiceDisabled => "service_disabled",
            ErrorKind::NoHealthyInstances => "no_healthy_instances",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::CacheConnection => "cache_connection",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Config => "config_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl RegistryError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Validation { .. } => ErrorKind::Validation,
            RegistryError::DuplicateInstance { .. } => ErrorKind::DuplicateInstance,
            RegistryError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            RegistryError::ServiceDisabled { .. } => ErrorKind::ServiceDisabled,
            RegistryError::NoHealthyInstances(_) => ErrorKind::NoHealthyInstances,
            RegistryError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            RegistryError::CacheConnection(_) => ErrorKind::CacheConnection,
            RegistryError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            RegistryError::Config(_) => ErrorKind::Config,
            RegistryError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors a caller may reasonably retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::NoHealthyInstances(_)
                | RegistryError::ServiceUnavailable { .. }
                | RegistryError::StoreUnavailable(_)
        )
    }
}

impl From<validator::ValidationErrors> for RegistryError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field = errors
            .field_errors()
            .keys()
            .next()
            .map(|field| field.to_string())
            .unwrap_or_else(|| "request".to_string());
        RegistryError::Validation {
            field,
            message: errors.to_string(),
        }
    }
}

impl From<store::StoreError> for RegistryError {
    fn from(error: store::StoreError) -> Self {
        match error {
            store::StoreError::Conflict { service, address } => {
                RegistryError::DuplicateInstance { service, address }
            }
            other => RegistryError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<cache::CacheError> for RegistryError {
    fn from(error: cache::CacheError) -> Self {
        RegistryError::CacheConnection(error.to_string())
    }
}

/// Result type alias for the hybrid registry library
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default admin API port
pub const DEFAULT_PORT: u16 = 8080;

/// Maximum service name length
pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// Cache default settings
pub mod cache_defaults {
    pub const LOCAL_TTL_SECONDS: u64 = 5;
    pub const LOCAL_CAPACITY: usize = 1024;
    pub const DISTRIBUTED_TTL_SECONDS: u64 = 300;
    pub const KEY_PREFIX: &str = "registry:";
    pub const OPERATION_TIMEOUT_MS: u64 = 250;
}

/// Decision engine default settings
pub mod decision_defaults {
    pub const HEALTH_THRESHOLD: f64 = 0.8;
    pub const LOAD_THRESHOLD: f64 = 0.7;
    pub const MAX_ROUTER_REQUEST_BYTES: usize = 1024 * 1024;
    pub const CACHE_TTL_MS: u64 = 500;
}

/// Health check default settings
pub mod health_check {
    pub const DEFAULT_INTERVAL: u64 = 30;
    pub const DEFAULT_RETRY_INTERVAL: u64 = 10;
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_EVICTION_WINDOW: u64 = 600;
    pub const DEFAULT_BASELINE_LATENCY_MS: f64 = 100.0;
    pub const DEFAULT_DEGRADED_DECAY: f64 = 0.75;
    pub const DEFAULT_HISTORY_SIZE: usize = 100;
    pub const DEFAULT_HTTP_PATH: &str = "/health";
}

/// Load balancer default settings
pub mod lb_defaults {
    pub const MIN_HEALTH_SCORE: f64 = 0.5;
    /// Floor applied to computed weights so every eligible instance can be picked
    pub const MIN_WEIGHT: f64 = 1e-9;
}

/// Utility functions and helpers
pub mod utils {
    use crate::RegistryError;
    use once_cell::sync::Lazy;
    use regex::Regex;

    static SERVICE_NAME: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("service name pattern is valid")
    });

    /// Validate a service name: lowercase, starts with a letter, at most 63 characters
    pub fn validate_service_name(name: &str) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::validation(
                "name",
                "service name must not be empty",
            ));
        }

        if name.len() > crate::MAX_SERVICE_NAME_LEN {
            return Err(RegistryError::validation(
                "name",
                format!(
                    "service name exceeds {} characters",
                    crate::MAX_SERVICE_NAME_LEN
                ),
            ));
        }

        if !SERVICE_NAME.is_match(name) {
            return Err(RegistryError::validation(
                "name",
                format!(
                    "'{}' must start with a letter and contain only lowercase letters, digits, '-' or '_'",
                    name
                ),
            ));
        }

        Ok(())
    }

    /// Clamp a ratio into [0, 1], mapping NaN to 0
    pub fn clamp_unit(value: f64) -> f64 {
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        }
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        config::{Args, HybridRegistryConfig},
        decision::DecisionEngine,
        health::HealthMonitor,
        load_balancer::LoadBalancer,
        models::{
            CallPriority, CallRequest, ConnectionMethod, InstanceStatus, MethodChange,
            ResolvedMethod, ServiceDescriptor, ServiceInstance,
        },
        proxy::ServiceProxy,
        registry::{RegistryComponents, ServiceRegistry, ServiceRegistryImpl},
        transport::{InProcessRouter, RouteHandler},
        utils, ErrorKind, RegistryError, Result,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{AttemptFailure, ResolvedMethod};

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_validate_service_name() {
        assert!(utils::validate_service_name("pricing").is_ok());
        assert!(utils::validate_service_name("user_svc").is_ok());
        assert!(utils::validate_service_name("billing-v2").is_ok());
        assert!(utils::validate_service_name("").is_err());
        assert!(utils::validate_service_name("Pricing").is_err());
        assert!(utils::validate_service_name("9lives").is_err());
        assert!(utils::validate_service_name("has space").is_err());
        assert!(utils::validate_service_name(&"a".repeat(64)).is_err());
        assert!(utils::validate_service_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_error_kinds_are_stable() {
        let err = RegistryError::ServiceDisabled {
            service: "billing".to_string(),
            reason: "migration".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ServiceDisabled);
        assert_eq!(err.kind().as_str(), "service_disabled");
        assert!(err.to_string().contains("migration"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_service_unavailable_lists_attempts() {
        let err = RegistryError::ServiceUnavailable {
            service: "pricing".to_string(),
            attempts: vec![
                AttemptFailure {
                    method: ResolvedMethod::Router,
                    instance_id: None,
                    error: "handler panicked".to_string(),
                },
                AttemptFailure {
                    method: ResolvedMethod::Rest,
                    instance_id: None,
                    error: "connection refused".to_string(),
                },
            ],
        };

        let message = err.to_string();
        assert!(message.contains("router: handler panicked"));
        assert!(message.contains("rest: connection refused"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(utils::clamp_unit(1.5), 1.0);
        assert_eq!(utils::clamp_unit(-0.2), 0.0);
        assert_eq!(utils::clamp_unit(f64::NAN), 0.0);
        assert_eq!(utils::clamp_unit(0.4), 0.4);
    }
}
