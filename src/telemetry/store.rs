//! Telemetry persistence for trace reconstruction
//!
//! Postgres when `DATABASE_URL` (or `POSTGRES_URL`) is configured, in-memory
//! otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Step, TelemetryEvent};
use crate::Result;

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append(&self, event: &TelemetryEvent) -> Result<()>;

    /// Events for one request, ordered by event id.
    async fn events_for(&self, correlation_id: &str) -> Result<Vec<TelemetryEvent>>;
}

//
// ================= In-memory =================
//

#[derive(Default)]
pub struct InMemoryTelemetryStore {
    events: RwLock<HashMap<String, Vec<TelemetryEvent>>>,
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn append(&self, event: &TelemetryEvent) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.correlation_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events_for(&self, correlation_id: &str) -> Result<Vec<TelemetryEvent>> {
        let mut events = self
            .events
            .read()
            .await
            .get(correlation_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|event| event.event_id);
        Ok(events)
    }
}

//
// ================= Postgres =================
//

pub struct PgTelemetryStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgTelemetryStore {
    /// Lazily connecting store; the schema is created on first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| PipelineError::DatabaseError(format!("Invalid database URL: {}", e)))?;
        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS telemetry_events (
                      event_id UUID PRIMARY KEY,
                      correlation_id TEXT NOT NULL,
                      agent_name TEXT NOT NULL,
                      status TEXT NOT NULL,
                      kind TEXT NOT NULL,
                      audit_class TEXT NOT NULL,
                      step JSONB,
                      created_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_telemetry_events_correlation
                    ON telemetry_events (correlation_id, event_id);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                PipelineError::DatabaseError(format!(
                    "Failed to initialize telemetry schema: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

/// Enum to its serde string form, for TEXT columns.
fn to_db<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_db<T: DeserializeOwned>(value: String) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(value))?)
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn append(&self, event: &TelemetryEvent) -> Result<()> {
        self.ensure_schema().await?;

        let step = event.step.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO telemetry_events
              (event_id, correlation_id, agent_name, status, kind, audit_class, step, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(&event.correlation_id)
        .bind(&event.agent_name)
        .bind(to_db(&event.status)?)
        .bind(to_db(&event.kind)?)
        .bind(to_db(&event.audit_class)?)
        .bind(step)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::DatabaseError(format!("Failed to store telemetry: {}", e)))?;

        Ok(())
    }

    async fn events_for(&self, correlation_id: &str) -> Result<Vec<TelemetryEvent>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT event_id, correlation_id, agent_name, status, kind, audit_class,
                   step::text AS step, created_at
            FROM telemetry_events
            WHERE correlation_id = $1
            ORDER BY event_id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::DatabaseError(format!("Failed to load telemetry: {}", e)))?;

        rows.into_iter()
            .map(|row| -> Result<TelemetryEvent> {
                let column = |e: sqlx::Error| PipelineError::DatabaseError(e.to_string());
                let step: Option<String> = row.try_get("step").map_err(column)?;
                let step: Option<Step> = step.map(|s| serde_json::from_str(&s)).transpose()?;
                Ok(TelemetryEvent {
                    event_id: row.try_get::<Uuid, _>("event_id").map_err(column)?,
                    correlation_id: row.try_get("correlation_id").map_err(column)?,
                    agent_name: row.try_get("agent_name").map_err(column)?,
                    status: from_db(row.try_get("status").map_err(column)?)?,
                    kind: from_db(row.try_get("kind").map_err(column)?)?,
                    audit_class: from_db(row.try_get("audit_class").map_err(column)?)?,
                    step,
                    timestamp: row.try_get("created_at").map_err(column)?,
                })
            })
            .collect()
    }
}

/// Postgres store when a database URL is given, in-memory otherwise.
pub fn build_telemetry_store(database_url: Option<&str>) -> Arc<dyn TelemetryStore> {
    if let Some(url) = database_url {
        match PgTelemetryStore::connect_lazy(url) {
            Ok(store) => {
                info!("Telemetry store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres telemetry store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Telemetry store backend: in-memory");
    Arc::new(InMemoryTelemetryStore::new())
}
