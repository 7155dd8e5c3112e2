//! Alert data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::window::{WindowKind, WindowTotal};

/// Spending relative to a limit, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Below the approaching threshold
    #[default]
    Ok,
    /// At or above the approaching ratio, below the limit
    Approaching,
    /// At or above the limit
    Exceeded,
}

impl Severity {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Approaching => "approaching",
            Self::Exceeded => "exceeded",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" | "none" => Ok(Self::Ok),
            "approaching" => Ok(Self::Approaching),
            "exceeded" => Ok(Self::Exceeded),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Notification state of one window kind.
///
/// `last_alert_level` is the highest severity already notified for the window
/// instance starting at `window_start`; `Severity::Ok` means nothing was sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertState {
    /// Start of the window instance the level refers to
    pub window_start: Option<DateTime<Utc>>,
    /// Highest severity notified in that instance
    pub last_alert_level: Severity,
    /// When the last notification for this kind was emitted, any instance
    pub last_alert_time: Option<DateTime<Utc>>,
}

impl AlertState {
    /// Fresh state for a new window instance, keeping the last alert time
    pub fn rolled_over(&self, window_start: DateTime<Utc>) -> Self {
        Self {
            window_start: Some(window_start),
            last_alert_level: Severity::Ok,
            last_alert_time: self.last_alert_time,
        }
    }
}

/// Structured payload handed to notification channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Window kind that crossed a threshold
    pub kind: WindowKind,
    /// Severity reached
    pub severity: Severity,
    /// Window spending at the time of the crossing
    pub sum_cost: Decimal,
    /// Configured limit
    pub limit: Decimal,
    /// Inclusive window start
    pub window_start: DateTime<Utc>,
    /// Exclusive window end
    pub window_end: DateTime<Utc>,
    /// Events counted in the window
    pub event_count: u64,
    /// When the dispatcher emitted the alert
    pub triggered_at: DateTime<Utc>,
}

impl AlertNotification {
    /// Build a notification from a window total
    pub fn from_total(
        total: &WindowTotal,
        severity: Severity,
        limit: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: total.kind.clone(),
            severity,
            sum_cost: total.sum_cost,
            limit,
            window_start: total.window_start,
            window_end: total.window_end,
            event_count: total.event_count,
            triggered_at,
        }
    }

    /// Spending above the limit, zero when below
    pub fn overage(&self) -> Decimal {
        (self.sum_cost - self.limit).max(Decimal::ZERO)
    }

    /// Spending as a percentage of the limit
    pub fn percent_of_limit(&self) -> Decimal {
        if self.limit.is_zero() {
            return Decimal::ZERO;
        }
        (self.sum_cost / self.limit * Decimal::ONE_HUNDRED).round_dp(1)
    }

    /// One-line human-readable summary
    pub fn message(&self) -> String {
        let verb = match self.severity {
            Severity::Exceeded => "exceeded",
            Severity::Approaching => "is approaching",
            Severity::Ok => "is within",
        };

        format!(
            "{} spending {} its limit: ${} of ${} ({}%) for {} - {}",
            self.kind,
            verb,
            self.sum_cost.round_dp(4),
            self.limit.round_dp(2),
            self.percent_of_limit(),
            self.window_start.format("%Y-%m-%d %H:%M"),
            self.window_end.format("%Y-%m-%d %H:%M"),
        )
    }
}

/// Outcome of one channel send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Channel name
    pub channel: String,
    /// Whether it succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// When the send was attempted
    pub sent_at: DateTime<Utc>,
}

/// An emitted alert as stored in the alert log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// The notification that was emitted
    pub notification: AlertNotification,
    /// Per-channel delivery outcome
    pub deliveries: Vec<DeliveryResult>,
}
