//! PostgreSQL ledger and alert log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{AlertLog, Ledger};
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{AlertRecord, EventRecord, Metadata, Severity, WindowKind};

/// Postgres-backed [`Ledger`] and [`AlertLog`]
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a new connection pool
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert_if_absent(&self, event: &EventRecord) -> Result<bool> {
        // The primary key on id makes this the atomic de-duplication point
        let result = sqlx::query(
            r#"
            INSERT INTO spend_events (id, ts, cost, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(event.timestamp)
        .bind(event.cost)
        .bind(serde_json::Value::Object(event.metadata.clone()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM spend_events WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn sum_cost_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Decimal> {
        let sum: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(cost), 0)
            FROM spend_events
            WHERE ts >= $1 AND ts < $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    async fn iterate_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, ts, cost, metadata
            FROM spend_events
            WHERE ts >= $1 AND ts < $2
            ORDER BY ts, id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AlertLog for PostgresLedger {
    async fn record(&self, record: &AlertRecord) -> Result<()> {
        let n = &record.notification;
        let deliveries = serde_json::to_value(&record.deliveries)?;

        sqlx::query(
            r#"
            INSERT INTO alert_history (
                kind, window_start, window_end, severity,
                sum_cost, spend_limit, triggered_at, deliveries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(n.kind.name())
        .bind(n.window_start)
        .bind(n.window_end)
        .bind(n.severity.as_str())
        .bind(n.sum_cost)
        .bind(n.limit)
        .bind(n.triggered_at)
        .bind(&deliveries)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn highest_level(
        &self,
        kind: &WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<Severity> {
        let severities: Vec<String> = sqlx::query_scalar(
            "SELECT severity FROM alert_history WHERE kind = $1 AND window_start = $2",
        )
        .bind(kind.name())
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;

        Ok(severities
            .iter()
            .filter_map(|s| s.parse::<Severity>().ok())
            .max()
            .unwrap_or_default())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    ts: DateTime<Utc>,
    cost: Decimal,
    metadata: serde_json::Value,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        let metadata = match row.metadata {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        };

        EventRecord {
            id: row.id,
            timestamp: row.ts,
            cost: row.cost,
            metadata,
        }
    }
}
