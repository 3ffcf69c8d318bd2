//! PostgreSQL durable store

use super::{DurableStore, StoreError};
use crate::config::PostgresConfig;
use crate::models::{ConnectionMethod, InstanceStatus, ServiceDescriptor, ServiceInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS registered_services (
        name VARCHAR(63) PRIMARY KEY,
        connection_method VARCHAR(16) NOT NULL
            CHECK (connection_method IN ('router', 'rest', 'hybrid', 'disabled')),
        disabled_reason TEXT,
        metadata JSONB NOT NULL DEFAULT '{}',
        registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS service_instances (
        id UUID PRIMARY KEY,
        service_name VARCHAR(63) NOT NULL REFERENCES registered_services(name) ON DELETE CASCADE,
        host VARCHAR(255) NOT NULL,
        port INTEGER NOT NULL CHECK (port > 0 AND port <= 65535),
        health_check_url TEXT,
        status VARCHAR(16) NOT NULL DEFAULT 'starting',
        registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (service_name, host, port)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_service_instances_service ON service_instances(service_name)",
];

/// Durable store on a sqlx PostgreSQL pool
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

/// SQLSTATE of a unique constraint violation
const UNIQUE_VIOLATION: &str = "23505";

fn instance_write_error(error: sqlx::Error, instance: &ServiceInstance) -> StoreError {
    let unique_violation = error
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false);

    if unique_violation {
        StoreError::Conflict {
            service: instance.service_name.clone(),
            address: instance.address(),
        }
    } else {
        StoreError::Database(error)
    }
}

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Open a connection pool from configuration
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .max_lifetime(Duration::from_secs(config.max_lifetime))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create the registry tables if they do not exist
    pub async fn create_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Registry schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn row_to_descriptor(row: &PgRow) -> Result<ServiceDescriptor, StoreError> {
        let method: String = row.try_get("connection_method")?;
        let metadata: Json<HashMap<String, String>> = row.try_get("metadata")?;

        Ok(ServiceDescriptor {
            name: row.try_get("name")?,
            connection_method: method
                .parse::<ConnectionMethod>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            disabled_reason: row.try_get("disabled_reason")?,
            metadata: metadata.0,
            registered_at: row.try_get::<DateTime<Utc>, _>("registered_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_instance(row: &PgRow) -> Result<ServiceInstance, StoreError> {
        let port: i32 = row.try_get("port")?;
        let status: String = row.try_get("status")?;

        Ok(ServiceInstance {
            id: row.try_get("id")?,
            service_name: row.try_get("service_name")?,
            host: row.try_get("host")?,
            port: u16::try_from(port)
                .map_err(|_| StoreError::Corrupt(format!("port {} out of range", port)))?,
            health_check_url: row.try_get("health_check_url")?,
            status: status
                .parse::<InstanceStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            registered_at: row.try_get::<DateTime<Utc>, _>("registered_at")?,
        })
    }
}

const SELECT_SERVICE: &str = "SELECT name, connection_method, disabled_reason, metadata, registered_at, updated_at FROM registered_services";

const SELECT_INSTANCE: &str = "SELECT id, service_name, host, port, health_check_url, status, registered_at FROM service_instances";

#[async_trait]
impl DurableStore for PostgresStore {
    async fn get_service(&self, name: &str) -> Result<Option<ServiceDescriptor>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE name = $1", SELECT_SERVICE))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_descriptor).transpose()
    }

    async fn put_service(&self, descriptor: &ServiceDescriptor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO registered_services
                (name, connection_method, disabled_reason, metadata, registered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                connection_method = EXCLUDED.connection_method,
                disabled_reason = EXCLUDED.disabled_reason,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&descriptor.name)
        .bind(descriptor.connection_method.as_str())
        .bind(&descriptor.disabled_reason)
        .bind(Json(&descriptor.metadata))
        .bind(descriptor.registered_at)
        .bind(descriptor.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(
            "Persisted service {} ({})",
            descriptor.name, descriptor.connection_method
        );
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM registered_services WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, StoreError> {
        let rows = sqlx::query(&format!("{} ORDER BY name", SELECT_SERVICE))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_descriptor).collect()
    }

    async fn get_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE service_name = $1 ORDER BY registered_at",
            SELECT_INSTANCE
        ))
        .bind(service_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn list_instances(&self) -> Result<Vec<ServiceInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY service_name, registered_at",
            SELECT_INSTANCE
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_instance).collect()
    }

    async fn put_instance(&self, instance: &ServiceInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_instances
                (id, service_name, host, port, health_check_url, status, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                health_check_url = EXCLUDED.health_check_url,
                status = EXCLUDED.status
            "#,
        )
        .bind(instance.id)
        .bind(&instance.service_name)
        .bind(&instance.host)
        .bind(i32::from(instance.port))
        .bind(&instance.health_check_url)
        .bind(instance.status.as_str())
        .bind(instance.registered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| instance_write_error(e, instance))?;

        Ok(())
    }

    async fn delete_instance(
        &self,
        service_name: &str,
        instance_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM service_instances WHERE id = $1 AND service_name = $2")
                .bind(instance_id)
                .bind(service_name)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
