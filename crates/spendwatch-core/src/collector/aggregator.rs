//! Window aggregation
//!
//! Totals are always derivable from the ledger with a range scan. The monitor
//! keeps a [`RunningTotal`] per window kind so the hot path does not rescan, and
//! reseeds it from the ledger whenever a new window instance starts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::db::Ledger;
use crate::error::Result;
use crate::models::{EventRecord, WindowBounds, WindowKind, WindowTotal};

/// Computes window totals from the ledger
#[derive(Clone)]
pub struct WindowAggregator {
    ledger: Arc<dyn Ledger>,
}

impl WindowAggregator {
    /// Create an aggregator over a ledger
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Total of the window instance of `kind` containing `reference`
    pub async fn total(&self, kind: &WindowKind, reference: DateTime<Utc>) -> Result<WindowTotal> {
        let bounds = kind.bounds_for(reference);
        Ok(self.seed(bounds).await?.snapshot(kind))
    }

    /// Build a running total for `bounds` from a full ledger scan
    pub async fn seed(&self, bounds: WindowBounds) -> Result<RunningTotal> {
        let events = self.ledger.iterate_range(bounds.start, bounds.end).await?;

        let mut running = RunningTotal::new(bounds);
        for event in &events {
            running.add(event);
        }
        Ok(running)
    }
}

/// Incrementally maintained total of one window instance
#[derive(Debug, Clone)]
pub struct RunningTotal {
    bounds: WindowBounds,
    sum: Decimal,
    counted: HashSet<String>,
}

impl RunningTotal {
    /// Empty total for a window instance
    pub fn new(bounds: WindowBounds) -> Self {
        Self {
            bounds,
            sum: Decimal::ZERO,
            counted: HashSet::new(),
        }
    }

    /// Window instance this total covers
    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    /// Current sum
    pub fn sum(&self) -> Decimal {
        self.sum
    }

    /// Number of distinct events counted
    pub fn event_count(&self) -> u64 {
        self.counted.len() as u64
    }

    /// Whether an event id is already part of the sum
    pub fn has_counted(&self, id: &str) -> bool {
        self.counted.contains(id)
    }

    /// Count an event. Returns `false` if it lies outside the window, its id
    /// was already counted, or the sum would overflow.
    pub fn add(&mut self, event: &EventRecord) -> bool {
        if !self.bounds.contains(event.timestamp) || self.counted.contains(&event.id) {
            return false;
        }
        let Some(sum) = self.sum.checked_add(event.cost) else {
            warn!(id = %event.id, sum = %self.sum, cost = %event.cost, "Window total overflowed, event not counted");
            return false;
        };
        self.sum = sum;
        self.counted.insert(event.id.clone());
        true
    }

    /// Total as seen by callers
    pub fn snapshot(&self, kind: &WindowKind) -> WindowTotal {
        WindowTotal {
            kind: kind.clone(),
            window_start: self.bounds.start,
            window_end: self.bounds.end,
            sum_cost: self.sum,
            event_count: self.event_count(),
        }
    }
}
