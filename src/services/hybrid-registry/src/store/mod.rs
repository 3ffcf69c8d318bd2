//! Durable Store Module
//!
//! Authoritative record of every registered service and its instances. The
//! registry reads it only after both cache tiers miss and writes it before
//! invalidating the caches.

mod memory;
mod postgres;

pub use self::memory::InMemoryStore;
pub use self::postgres::PostgresStore;

use crate::models::{ServiceDescriptor, ServiceInstance};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Instance address {address} already registered for {service}")]
    Conflict { service: String, address: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence backend with get/put/delete-by-key semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch a descriptor by service name
    async fn get_service(&self, name: &str) -> Result<Option<ServiceDescriptor>, StoreError>;

    /// Insert or replace a descriptor; `registered_at` of an existing row is kept
    async fn put_service(&self, descriptor: &ServiceDescriptor) -> Result<(), StoreError>;

    /// Delete a descriptor and all of its instances
    async fn delete_service(&self, name: &str) -> Result<bool, StoreError>;

    /// All descriptors ordered by name
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, StoreError>;

    /// Instances of one service
    async fn get_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, StoreError>;

    /// Instances of every service
    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, StoreError>;

    /// Insert or replace an instance; another instance on the same host:port is a `Conflict`
    async fn put_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError>;

    /// Delete an instance, returning whether it existed
    async fn delete_instance(
        &self,
        service_name: &str,
        instance_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Backend name for logs
    fn backend_name(&self) -> &'static str;
}
