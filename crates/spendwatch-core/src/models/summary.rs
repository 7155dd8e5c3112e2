//! Spending summary returned by query endpoints

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::event::EventRecord;

/// Aggregate spending over a trailing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingSummary {
    pub total_requests: u64,
    pub total_cost: Decimal,
    pub avg_cost_per_request: Decimal,
    pub first_request: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
    pub hours_analyzed: u32,
}

impl SpendingSummary {
    /// Summarize records, counting each id once
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a EventRecord>,
        hours_analyzed: u32,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut total_requests = 0u64;
        let mut total_cost = Decimal::ZERO;
        let mut first_request: Option<DateTime<Utc>> = None;
        let mut last_request: Option<DateTime<Utc>> = None;

        for record in records {
            if !seen.insert(record.id.as_str()) {
                continue;
            }
            total_requests += 1;
            total_cost = total_cost.saturating_add(record.cost);
            first_request = Some(first_request.map_or(record.timestamp, |t| t.min(record.timestamp)));
            last_request = Some(last_request.map_or(record.timestamp, |t| t.max(record.timestamp)));
        }

        let avg_cost_per_request = if total_requests == 0 {
            Decimal::ZERO
        } else {
            total_cost / Decimal::from(total_requests)
        };

        Self {
            total_requests,
            total_cost,
            avg_cost_per_request,
            first_request,
            last_request,
            hours_analyzed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_summary() {
        let records: Vec<EventRecord> = Vec::new();
        let summary = SpendingSummary::from_records(&records, 24);
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.total_cost, Decimal::ZERO);
        assert_eq!(summary.avg_cost_per_request, Decimal::ZERO);
        assert!(summary.first_request.is_none());
        assert_eq!(summary.hours_analyzed, 24);
    }

    #[test]
    fn test_summary_counts_ids_once() {
        let t1 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        let records = vec![
            EventRecord::new("a", t2, Decimal::new(300, 2)),
            EventRecord::new("b", t1, Decimal::new(100, 2)),
            EventRecord::new("a", t2, Decimal::new(300, 2)),
        ];

        let summary = SpendingSummary::from_records(&records, 6);

        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_cost, Decimal::new(4, 0));
        assert_eq!(summary.avg_cost_per_request, Decimal::new(2, 0));
        assert_eq!(summary.first_request, Some(t1));
        assert_eq!(summary.last_request, Some(t2));
    }
}
