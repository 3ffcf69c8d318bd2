//! Transport Module
//!
//! The two ways a call can reach a service:
//! - [`RouterTransport`]: synchronous in-process dispatch to a mounted handler
//! - [`RestTransport`]: HTTP request to a remote instance
//!
//! Both report failures as [`TransportError`], which never crosses the proxy
//! boundary.

use crate::models::ServiceInstance;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    #[error("service '{0}' is not mounted in this process")]
    NotMounted(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl TransportError {
    fn from_reqwest(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            TransportError::Timeout(timeout)
        } else if error.is_decode() {
            TransportError::Decode(error.to_string())
        } else {
            TransportError::Connection(error.to_string())
        }
    }
}

/// An in-process service endpoint
pub trait RouteHandler: Send + Sync {
    /// Execute `method` with `args`
    fn handle(&self, method: &str, args: &Value) -> Result<Value, TransportError>;

    /// In-process liveness check
    fn is_ready(&self) -> bool {
        true
    }

    /// Fraction of capacity in use, when the handler tracks it
    fn load(&self) -> Option<f64> {
        None
    }
}

impl<F> RouteHandler for F
where
    F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync,
{
    fn handle(&self, method: &str, args: &Value) -> Result<Value, TransportError> {
        self(method, args)
    }
}

/// In-process dispatch
#[cfg_attr(test, mockall::automock)]
pub trait RouterTransport: Send + Sync {
    /// Whether the service is mounted in this process
    fn is_mounted(&self, service: &str) -> bool;

    /// Whether the mounted service currently accepts calls
    fn is_callable(&self, service: &str) -> bool;

    /// Load reported by the mounted handler
    fn load(&self, service: &str) -> Option<f64>;

    /// Invoke `method` synchronously
    fn invoke(&self, service: &str, method: &str, args: &Value) -> Result<Value, TransportError>;
}

/// Table of handlers mounted in this process
#[derive(Default)]
pub struct InProcessRouter {
    handlers: DashMap<String, Arc<dyn RouteHandler>>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a handler, replacing any previous one for the service
    pub fn mount(&self, service: impl Into<String>, handler: Arc<dyn RouteHandler>) {
        let service = service.into();
        info!("Mounted in-process handler for service {}", service);
        self.handlers.insert(service, handler);
    }

    pub fn unmount(&self, service: &str) -> bool {
        self.handlers.remove(service).is_some()
    }

    pub fn mounted_services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    fn handler(&self, service: &str) -> Option<Arc<dyn RouteHandler>> {
        self.handlers.get(service).map(|entry| Arc::clone(entry.value()))
    }
}

impl RouterTransport for InProcessRouter {
    fn is_mounted(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    fn is_callable(&self, service: &str) -> bool {
        self.handler(service)
            .map(|handler| handler.is_ready())
            .unwrap_or(false)
    }

    fn load(&self, service: &str) -> Option<f64> {
        self.handler(service).and_then(|handler| handler.load())
    }

    fn invoke(&self, service: &str, method: &str, args: &Value) -> Result<Value, TransportError> {
        // Clone the handler out so the map shard is not held during the call
        let handler = self
            .handler(service)
            .ok_or_else(|| TransportError::NotMounted(service.to_string()))?;
        handler.handle(method, args)
    }
}

/// Parsed health-check answer
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub healthy: bool,
    pub load: Option<f64>,
    pub detail: Option<String>,
}

/// Network dispatch
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestTransport: Send + Sync {
    /// POST `{base_url}/{method}` with `{"args": args}`
    async fn invoke(
        &self,
        instance: &ServiceInstance,
        method: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// GET the instance health address
    async fn probe(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
    ) -> Result<ProbeResponse, TransportError>;
}

#[derive(Deserialize)]
struct HealthBody {
    status: Option<String>,
    load: Option<f64>,
}

/// reqwest-based [`RestTransport`]
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("hybrid-registry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn invoke(
        &self,
        instance: &ServiceInstance,
        method: &str,
        args: &Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let url = format!("{}/{}", instance.base_url(), method.trim_start_matches('/'));
        debug!("POST {} for service {}", url, instance.service_name);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&json!({ "args": args }))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::MethodNotFound(method.to_string()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).chars().take(512).collect(),
            });
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn probe(
        &self,
        instance: &ServiceInstance,
        timeout: Duration,
    ) -> Result<ProbeResponse, TransportError> {
        let response = self
            .client
            .get(instance.health_url())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Ok(ProbeResponse {
                healthy: false,
                load: None,
                detail: Some(format!("health endpoint returned HTTP {}", status.as_u16())),
            });
        }

        // A non-JSON 2xx body still counts as alive
        let body = response.json::<HealthBody>().await.ok();
        let status_field = body.as_ref().and_then(|b| b.status.clone());
        let healthy = !matches!(
            status_field.as_deref(),
            Some("unhealthy") | Some("down")
        );

        Ok(ProbeResponse {
            healthy,
            load: body.and_then(|b| b.load),
            detail: status_field,
        })
    }
}
