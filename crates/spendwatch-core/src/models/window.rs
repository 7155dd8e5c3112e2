//! Spending window models
//!
//! A window kind maps any point in time to the half-open window instance
//! `[start, end)` that contains it. Calendar kinds are aligned to UTC; custom
//! kinds have a fixed width aligned to the Unix epoch.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Upper bound for custom window widths (ten years)
pub const MAX_CUSTOM_WIDTH_SECS: u64 = 10 * 366 * 24 * 3600;

/// Kind of spending window
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Calendar hour
    Hourly,
    /// Calendar day (UTC)
    Daily,
    /// Calendar month (UTC)
    Monthly,
    /// Fixed-width window aligned to the Unix epoch
    Custom {
        /// Label used in alerts and queries
        name: String,
        /// Width in seconds
        width_secs: u64,
    },
}

impl WindowKind {
    /// Create a custom window kind
    pub fn custom(name: impl Into<String>, width: std::time::Duration) -> Self {
        Self::Custom {
            name: name.into(),
            width_secs: width.as_secs(),
        }
    }

    /// Label of this kind
    pub fn name(&self) -> &str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
            Self::Custom { name, .. } => name,
        }
    }

    /// Window instance containing `at`
    pub fn bounds_for(&self, at: DateTime<Utc>) -> WindowBounds {
        let day_start = at.date_naive().and_time(NaiveTime::MIN).and_utc();

        match self {
            Self::Hourly => {
                let start = day_start + Duration::hours(i64::from(at.hour()));
                WindowBounds::new(start, start + Duration::hours(1))
            }
            Self::Daily => WindowBounds::new(day_start, day_start + Duration::days(1)),
            Self::Monthly => {
                let start = day_start - Duration::days(i64::from(at.day0()));
                // 32 days past the 1st always lands in the next month
                let next_month = start + Duration::days(32);
                let end = next_month - Duration::days(i64::from(next_month.day0()));
                WindowBounds::new(start, end)
            }
            Self::Custom { width_secs, .. } => {
                let width = (*width_secs).clamp(1, MAX_CUSTOM_WIDTH_SECS) as i64;
                let offset = at.timestamp().rem_euclid(width);
                let start = at
                    - Duration::seconds(offset)
                    - Duration::nanoseconds(i64::from(at.timestamp_subsec_nanos()));
                WindowBounds::new(start, start + Duration::seconds(width))
            }
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open interval `[start, end)` of one window instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create bounds from start and end
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whether `at` falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// A configured window kind and its optional limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDefinition {
    /// Window kind
    pub kind: WindowKind,
    /// Spending ceiling; `None` means the kind is tracked but never evaluated
    pub limit: Option<Decimal>,
}

impl WindowDefinition {
    /// Create a window definition
    pub fn new(kind: WindowKind, limit: Option<Decimal>) -> Self {
        Self { kind, limit }
    }
}

/// Spending total of one window instance, derived from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowTotal {
    /// Window kind
    pub kind: WindowKind,
    /// Inclusive start
    pub window_start: DateTime<Utc>,
    /// Exclusive end
    pub window_end: DateTime<Utc>,
    /// Sum of event costs in the window, each id counted once
    pub sum_cost: Decimal,
    /// Number of distinct events in the window
    pub event_count: u64,
}

impl WindowTotal {
    /// Total of an empty window
    pub fn empty(kind: WindowKind, bounds: WindowBounds) -> Self {
        Self {
            kind,
            window_start: bounds.start,
            window_end: bounds.end,
            sum_cost: Decimal::ZERO,
            event_count: 0,
        }
    }

    /// Bounds of this total's window instance
    pub fn bounds(&self) -> WindowBounds {
        WindowBounds::new(self.window_start, self.window_end)
    }
}
