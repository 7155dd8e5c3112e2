//! Storage layer for Spendwatch
//!
//! The ledger is the durable, append-only store of accepted cost events and the
//! source of truth for every window total. The alert log remembers which
//! notifications were emitted per window instance.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{AlertRecord, EventRecord, Severity, WindowKind};

/// Append-only event store with range queries
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Persist `event` unless its id is already present.
    ///
    /// Returns `false` for an existing id. Must be atomic with respect to
    /// concurrent inserts of the same id.
    async fn insert_if_absent(&self, event: &EventRecord) -> Result<bool>;

    /// Whether an event with this id was already accepted
    async fn contains(&self, id: &str) -> Result<bool>;

    /// Sum of costs with `start <= timestamp < end`
    async fn sum_cost_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Decimal>;

    /// Events with `start <= timestamp < end`, ordered by timestamp
    async fn iterate_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>>;

    /// Check the store is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Record of emitted alerts
#[async_trait]
pub trait AlertLog: Send + Sync {
    /// Append an emitted alert
    async fn record(&self, record: &AlertRecord) -> Result<()>;

    /// Highest severity emitted for a window instance, `Severity::Ok` if none
    async fn highest_level(&self, kind: &WindowKind, window_start: DateTime<Utc>)
        -> Result<Severity>;
}

/// Ledger and alert log bundle
#[derive(Clone)]
pub struct Stores {
    /// Event ledger
    pub ledger: Arc<dyn Ledger>,
    /// Alert log
    pub alert_log: Arc<dyn AlertLog>,
}

impl Stores {
    /// Connect to Postgres when a URL is configured, otherwise keep everything in memory
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        match config.url.as_deref() {
            Some(url) if !url.is_empty() => {
                let pg = Arc::new(PostgresLedger::connect(url, config).await?);
                pg.migrate().await?;
                Ok(Self {
                    ledger: pg.clone(),
                    alert_log: pg,
                })
            }
            _ => {
                warn!("No database URL configured, events are kept in memory and lost on restart");
                Ok(Self::in_memory())
            }
        }
    }

    /// In-memory stores
    pub fn in_memory() -> Self {
        let memory = Arc::new(InMemoryLedger::new());
        Self {
            ledger: memory.clone(),
            alert_log: memory,
        }
    }
}
