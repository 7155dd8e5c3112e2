//! In-memory ledger for tests and database-less runs.
//!
//! Data is lost when the struct is dropped. Range queries are linear scans.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{AlertLog, Ledger};
use crate::error::{Error, Result};
use crate::models::{AlertRecord, EventRecord, Severity, WindowKind};

/// In-memory [`Ledger`] and [`AlertLog`]
#[derive(Default)]
pub struct InMemoryLedger {
    events: RwLock<HashMap<String, EventRecord>>,
    alerts: RwLock<Vec<AlertRecord>>,
}

impl InMemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether no events are stored
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// All recorded alerts, oldest first
    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn insert_if_absent(&self, event: &EventRecord) -> Result<bool> {
        let mut events = self.events.write().await;
        match events.entry(event.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(true)
            }
        }
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.events.read().await.contains_key(id))
    }

    async fn sum_cost_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Decimal> {
        let events = self.events.read().await;
        events
            .values()
            .filter(|e| start <= e.timestamp && e.timestamp < end)
            .try_fold(Decimal::ZERO, |sum, e| sum.checked_add(e.cost))
            .ok_or_else(|| Error::ledger("cost sum overflowed"))
    }

    async fn iterate_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>> {
        let events = self.events.read().await;
        let mut out: Vec<EventRecord> = events
            .values()
            .filter(|e| start <= e.timestamp && e.timestamp < end)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl AlertLog for InMemoryLedger {
    async fn record(&self, record: &AlertRecord) -> Result<()> {
        self.alerts.write().await.push(record.clone());
        Ok(())
    }

    async fn highest_level(
        &self,
        kind: &WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<Severity> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .filter(|r| &r.notification.kind == kind && r.notification.window_start == window_start)
            .map(|r| r.notification.severity)
            .max()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::AlertNotification;
    use chrono::{Duration, TimeZone};

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_if_absent_rejects_repeat_id() {
        let ledger = InMemoryLedger::new();
        let event = EventRecord::new("req-1", hour(14), Decimal::new(3, 0));

        assert!(ledger.insert_if_absent(&event).await.unwrap());
        assert!(!ledger.insert_if_absent(&event).await.unwrap());
        assert!(ledger.contains("req-1").await.unwrap());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_of_same_id_accept_one() {
        let ledger = Arc::new(InMemoryLedger::new());
        let event = EventRecord::new("req-1", hour(14), Decimal::ONE);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let event = event.clone();
                tokio::spawn(async move { ledger.insert_if_absent(&event).await.unwrap() })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_range_queries_are_half_open() {
        let ledger = InMemoryLedger::new();
        for (id, ts, cost) in [
            ("before", hour(13) + Duration::minutes(59), 1),
            ("start", hour(14), 2),
            ("inside", hour(14) + Duration::minutes(30), 4),
            ("end", hour(15), 8),
        ] {
            ledger
                .insert_if_absent(&EventRecord::new(id, ts, Decimal::from(cost)))
                .await
                .unwrap();
        }

        let sum = ledger.sum_cost_in_range(hour(14), hour(15)).await.unwrap();
        assert_eq!(sum, Decimal::from(6));

        let ids: Vec<String> = ledger
            .iterate_range(hour(14), hour(15))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["start", "inside"]);
    }

    #[tokio::test]
    async fn test_empty_range_sums_to_zero() {
        let ledger = InMemoryLedger::new();
        let sum = ledger.sum_cost_in_range(hour(1), hour(2)).await.unwrap();
        assert_eq!(sum, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_sum_overflow_is_an_error() {
        let ledger = InMemoryLedger::new();
        let huge = Decimal::from_i128_with_scale(5 * 10_i128.pow(28), 0);
        for id in ["a", "b"] {
            ledger
                .insert_if_absent(&EventRecord::new(id, hour(1), huge))
                .await
                .unwrap();
        }

        let err = ledger.sum_cost_in_range(hour(1), hour(2)).await.unwrap_err();
        assert!(matches!(err, Error::LedgerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_highest_level_per_instance() {
        let ledger = InMemoryLedger::new();
        let make = |start: DateTime<Utc>, severity| AlertRecord {
            notification: AlertNotification {
                kind: WindowKind::Hourly,
                severity,
                sum_cost: Decimal::new(11, 0),
                limit: Decimal::new(10, 0),
                window_start: start,
                window_end: start + Duration::hours(1),
                event_count: 1,
                triggered_at: start,
            },
            deliveries: vec![],
        };

        ledger.record(&make(hour(14), Severity::Approaching)).await.unwrap();
        ledger.record(&make(hour(14), Severity::Exceeded)).await.unwrap();
        ledger.record(&make(hour(15), Severity::Approaching)).await.unwrap();

        let hourly = WindowKind::Hourly;
        let level = |start| ledger.highest_level(&hourly, start);
        assert_eq!(level(hour(14)).await.unwrap(), Severity::Exceeded);
        assert_eq!(level(hour(15)).await.unwrap(), Severity::Approaching);
        assert_eq!(level(hour(16)).await.unwrap(), Severity::Ok);
        assert_eq!(
            ledger.highest_level(&WindowKind::Daily, hour(14)).await.unwrap(),
            Severity::Ok
        );
    }
}
