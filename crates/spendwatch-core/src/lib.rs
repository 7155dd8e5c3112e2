//! # Spendwatch
//!
//! Spending aggregation and threshold alerting for AI API cost webhooks.
//!
//! Every accepted cost event is persisted once in a ledger, folded into
//! hourly, daily, monthly and custom window totals, and checked against
//! configured limits. Crossing the approaching ratio or the limit itself
//! notifies Slack, Discord or generic webhooks, once per level per window.
//!
//! ## Architecture
//!
//! - **Collector**: webhook payload parsing, price table, window aggregation
//! - **Storage**: Postgres ledger and alert log, or an in-memory fallback
//! - **Alerting**: threshold evaluation, notification suppression, channels
//! - **Monitor**: the single entry point tying the above together
//! - **API**: axum webhook receiver and spending queries
//!
//! ## Quick Start
//!
//! ```bash
//! # Receive webhooks on :8000 with a $10 hourly limit
//! HOURLY_SPEND_LIMIT=10 spendwatch serve
//!
//! # Spending over the last 24 hours
//! spendwatch summary --hours 24
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod alerting;
pub mod api;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod monitor;
pub mod telemetry;

pub use config::Config;
pub use error::{Error, Result};
pub use monitor::{AcceptanceOutcome, AcceptanceResult, MonitorController};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertDispatcher, NotificationChannel, ThresholdEvaluator};
    pub use crate::config::Config;
    pub use crate::db::{AlertLog, InMemoryLedger, Ledger, Stores};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::monitor::{AcceptanceOutcome, AcceptanceResult, MonitorController};
}
