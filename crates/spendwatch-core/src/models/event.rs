//! Cost event data models

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque auxiliary fields carried with an event (model name, token counts, ...)
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Most decimal places a cost may carry (the ledger column is `NUMERIC(20, 10)`)
pub const MAX_COST_SCALE: u32 = 10;

/// Exclusive upper bound on a single cost, in whole currency units
pub const MAX_COST_UNITS: i64 = 10_000_000_000;

/// An accepted cost event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Source-provided request id, unique across the ledger
    pub id: String,

    /// When the cost was incurred
    pub timestamp: DateTime<Utc>,

    /// Non-negative cost in currency units
    pub cost: Decimal,

    /// Carried through, never interpreted
    #[serde(default)]
    pub metadata: Metadata,
}

impl EventRecord {
    /// Build a record with empty metadata
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, cost: Decimal) -> Self {
        Self {
            id: id.into(),
            timestamp,
            cost,
            metadata: Metadata::new(),
        }
    }
}

/// An event as handed over by the transport layer, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// Source-provided request id
    pub id: String,

    /// RFC 3339 timestamp; receipt time is used when absent
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Reported cost
    pub cost: Decimal,

    /// Auxiliary fields
    #[serde(default)]
    pub metadata: Metadata,
}

impl IncomingEvent {
    /// Create an incoming event without metadata
    pub fn new(id: impl Into<String>, timestamp: Option<String>, cost: Decimal) -> Self {
        Self {
            id: id.into(),
            timestamp,
            cost,
            metadata: Metadata::new(),
        }
    }

    /// Validate and convert into an immutable [`EventRecord`].
    ///
    /// `received_at` stands in for a missing timestamp.
    pub fn into_record(self, received_at: DateTime<Utc>) -> Result<EventRecord> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(Error::invalid("event id is empty"));
        }

        if self.cost < Decimal::ZERO {
            return Err(Error::invalid(format!("negative cost {}", self.cost)));
        }

        if self.cost >= Decimal::from(MAX_COST_UNITS) {
            return Err(Error::invalid(format!(
                "cost {} exceeds the maximum of {MAX_COST_UNITS}",
                self.cost
            )));
        }

        let cost = self.cost.normalize();
        if cost.scale() > MAX_COST_SCALE {
            return Err(Error::invalid(format!(
                "cost {} has more than {MAX_COST_SCALE} decimal places",
                self.cost
            )));
        }

        let timestamp = match self.timestamp.as_deref() {
            Some(raw) => parse_timestamp(raw)?,
            None => received_at,
        };

        Ok(EventRecord {
            id: id.to_string(),
            timestamp,
            cost,
            metadata: self.metadata,
        })
    }
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD HH:MM:SS[.f]` taken as UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::invalid(format!("unparseable timestamp '{raw}'")))
}
